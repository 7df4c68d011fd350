#![cfg(feature = "async_std")]
//! Hosts talking to each other over real sockets on the loopback interface.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_std::task;
use futures_executor::block_on;

use carambolas::error::host::{ConnectError, HostError};
use carambolas::host::Settings;
use carambolas::security::{Cipher, CipherFactory, Key, Keychain, Mac, Nonce, Security};
use carambolas::{Delivery, Event, Host, PeerReason, PeerState};

const DEADLINE: Duration = Duration::from_secs(5);

async fn open(settings: Settings) -> Host {
    Host::open("127.0.0.1:0", settings).await.unwrap()
}

fn server_settings() -> Settings {
    Settings {
        capacity: 4,
        max_channel: 3,
        ..Settings::default()
    }
}

/// Polls `host` until an event matching `accept` shows up. Other events are
/// discarded.
async fn wait_for<F>(host: &mut Host, mut accept: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    let start = Instant::now();
    loop {
        while let Some(event) = host.poll_event().unwrap() {
            if accept(&event) {
                return event;
            }
        }
        assert!(start.elapsed() < DEADLINE, "no matching event in time");
        task::sleep(Duration::from_millis(5)).await;
    }
}

/// Connects `client` to `server` and returns the endpoint of the client as
/// seen by the server.
async fn handshake(client: &mut Host, server: &mut Host, secure: bool) -> SocketAddr {
    let endpoint = server.local_addr();
    let peer = if secure {
        client.connect_secure(endpoint).unwrap()
    } else {
        client.connect(endpoint).unwrap()
    };
    assert_eq!(peer.state(), PeerState::Connecting);

    let accepted = wait_for(server, |e| matches!(e, Event::Connection(_))).await;
    wait_for(client, |e| matches!(e, Event::Connection(_))).await;
    assert_eq!(peer.state(), PeerState::Connected);
    accepted.peer().endpoint()
}

#[test]
fn connect_exchange_and_close() {
    block_on(async {
        let mut server = open(server_settings()).await;
        let mut client = open(Settings::default()).await;

        let remote = handshake(&mut client, &mut server, false).await;
        assert_eq!(remote, client.local_addr());
        assert_eq!(server.count(), 1);

        let peer = client.get_peer(&server.local_addr()).unwrap().clone();
        assert_eq!(peer.max_channel(), 0);
        peer.send(b"ping", Delivery::Reliable, 0).unwrap();

        let event = wait_for(&mut server, |e| matches!(e, Event::Data(..))).await;
        let (from, data) = match event {
            Event::Data(from, data) => (from, data),
            _ => unreachable!(),
        };
        assert_eq!(data.channel, 0);
        assert_eq!(data.payload.to_vec(), b"ping".to_vec());

        from.send(b"pong", Delivery::Unreliable, 0).unwrap();
        let event = wait_for(&mut client, |e| matches!(e, Event::Data(..))).await;
        match event {
            Event::Data(_, data) => assert_eq!(data.payload.to_vec(), b"pong".to_vec()),
            _ => unreachable!(),
        }

        peer.close(false);
        let event = wait_for(&mut client, |e| matches!(e, Event::Disconnection(..))).await;
        assert!(matches!(event, Event::Disconnection(_, PeerReason::Closed)));
        assert_eq!(client.count(), 0);

        let event = wait_for(&mut server, |e| matches!(e, Event::Disconnection(..))).await;
        assert!(matches!(event, Event::Disconnection(_, PeerReason::Reset)));
        assert_eq!(server.count(), 0);

        client.close().await;
        server.close().await;
    });
}

#[test]
fn reliable_datagrams_arrive_in_order() {
    block_on(async {
        let mut server = open(server_settings()).await;
        let mut client = open(Settings::default()).await;
        handshake(&mut client, &mut server, false).await;

        let peer = client.get_peer(&server.local_addr()).unwrap().clone();
        let big = vec![7u8; 4000];
        for i in 0..20u8 {
            peer.send(&[i], Delivery::Reliable, 0).unwrap();
        }
        peer.send(&big, Delivery::Reliable, 0).unwrap();

        let mut received = Vec::new();
        while received.len() < 21 {
            if let Event::Data(_, data) =
                wait_for(&mut server, |e| matches!(e, Event::Data(..))).await
            {
                received.push(data.payload.to_vec());
            }
        }
        for (i, payload) in received.iter().take(20).enumerate() {
            assert_eq!(payload, &vec![i as u8]);
        }
        assert_eq!(received[20], big);

        client.close().await;
        server.close().await;
    });
}

#[test]
fn channels_above_the_negotiated_limit_are_rejected() {
    block_on(async {
        let mut server = open(server_settings()).await;
        let mut client = open(Settings {
            max_channel: 1,
            ..Settings::default()
        })
        .await;
        handshake(&mut client, &mut server, false).await;

        let peer = client.get_peer(&server.local_addr()).unwrap().clone();
        assert_eq!(peer.max_channel(), 1);
        peer.send(b"one", Delivery::Semireliable, 1).unwrap();
        assert_eq!(
            peer.send(b"two", Delivery::Reliable, 2),
            Err(carambolas::error::peer::SendError::InvalidChannel)
        );

        let event = wait_for(&mut server, |e| matches!(e, Event::Data(..))).await;
        match event {
            Event::Data(_, data) => assert_eq!(data.channel, 1),
            _ => unreachable!(),
        }

        client.close().await;
        server.close().await;
    });
}

#[test]
fn closing_the_host_resets_its_peers() {
    block_on(async {
        let mut server = open(server_settings()).await;
        let mut client = open(Settings::default()).await;
        handshake(&mut client, &mut server, false).await;

        client.close().await;
        let event = wait_for(&mut server, |e| matches!(e, Event::Disconnection(..))).await;
        assert!(matches!(event, Event::Disconnection(_, PeerReason::Reset)));

        assert_eq!(client.poll_event().unwrap_err(), HostError::Closed);
        assert_eq!(
            client.connect(server.local_addr()).unwrap_err(),
            ConnectError::Host(HostError::Closed)
        );
        server.close().await;
    });
}

#[test]
fn unanswered_connect_becomes_unreachable() {
    block_on(async {
        // capacity 0 accepts nothing and answers nothing
        let mut server = open(Settings::default()).await;
        let mut client = open(Settings {
            connection_timeout: 1000,
            ..Settings::default()
        })
        .await;

        client.connect(server.local_addr()).unwrap();
        let event = wait_for(&mut client, |e| matches!(e, Event::Disconnection(..))).await;
        assert!(matches!(
            event,
            Event::Disconnection(_, PeerReason::Unreachable)
        ));
        assert!(server.poll_event().unwrap().is_none());

        client.close().await;
        server.close().await;
    });
}

#[test]
fn connect_errors() {
    block_on(async {
        let mut server = open(server_settings()).await;
        let mut client = open(Settings::default()).await;

        client.connect(server.local_addr()).unwrap();
        assert_eq!(
            client.connect(server.local_addr()).unwrap_err(),
            ConnectError::AlreadyConnected
        );
        assert_eq!(
            client.connect_secure(server.local_addr()).unwrap_err(),
            ConnectError::SecurityUnavailable
        );

        client.close().await;
        server.close().await;
    });
}

#[test]
fn invalid_addresses_do_not_bind() {
    block_on(async {
        let result = Host::open("not an address", Settings::default()).await;
        assert_eq!(result.unwrap_err(), HostError::AddrBindErr);
    });
}

/// Xors with the key. Good enough to tell keys apart, useless otherwise.
struct XorCipher(Key);

impl Cipher for XorCipher {
    fn encrypt_in_place(&mut self, text: &mut [u8], nonce: &Nonce) {
        let nonce = nonce.to_bytes();
        for (i, byte) in text.iter_mut().enumerate() {
            *byte ^= self.0 .0[i % 32] ^ nonce[i % 12];
        }
    }

    fn decrypt_in_place(&mut self, text: &mut [u8], nonce: &Nonce) {
        self.encrypt_in_place(text, nonce);
    }

    fn sign(&mut self, aad: &[u8], text: &[u8], nonce: &Nonce) -> Mac {
        let mut mac = [0u8; 16];
        for (i, byte) in aad.iter().chain(text).chain(&nonce.to_bytes()).enumerate() {
            let slot = i % 16;
            mac[slot] = mac[slot].rotate_left(1) ^ byte ^ self.0 .0[slot];
        }
        Mac(mac)
    }
}

struct XorFactory;

impl CipherFactory for XorFactory {
    fn create(&self, key: &Key) -> Box<dyn Cipher> {
        Box::new(XorCipher(*key))
    }
}

struct XorKeychain;

impl Keychain for XorKeychain {
    fn public_key(&self, private: &Key) -> Key {
        *private
    }

    fn shared_key(&self, private: &Key, remote_public: &Key) -> Key {
        let mut shared = [0u8; 32];
        for (i, byte) in shared.iter_mut().enumerate() {
            *byte = private.0[i] ^ remote_public.0[i];
        }
        Key(shared)
    }
}

fn secure(settings: Settings, seed: u8) -> Settings {
    Settings {
        security: Some(
            Security::new(Arc::new(XorFactory), Arc::new(XorKeychain))
                .with_private_key(Key([seed; 32])),
        ),
        ..settings
    }
}

#[test]
fn secure_sessions_exchange_data() {
    block_on(async {
        let mut server = open(secure(server_settings(), 3)).await;
        let mut client = open(secure(Settings::default(), 9)).await;
        assert_eq!(server.public_key(), Some(Key([3; 32])));

        handshake(&mut client, &mut server, true).await;
        let peer = client.get_peer(&server.local_addr()).unwrap().clone();
        assert!(peer.is_secure());
        peer.send(b"secret", Delivery::Reliable, 0).unwrap();

        let event = wait_for(&mut server, |e| matches!(e, Event::Data(..))).await;
        match event {
            Event::Data(from, data) => {
                assert!(from.is_secure());
                assert_eq!(data.payload.to_vec(), b"secret".to_vec());
            }
            _ => unreachable!(),
        }

        client.close().await;
        server.close().await;
    });
}

#[test]
fn secure_connect_validates_the_remote_key() {
    block_on(async {
        let mut server = open(secure(server_settings(), 3)).await;
        let mut client = open(secure(
            Settings {
                connection_timeout: 1000,
                ..Settings::default()
            },
            9,
        ))
        .await;

        client
            .connect_with_key(server.local_addr(), Key([4; 32]))
            .unwrap();
        let event = wait_for(&mut client, |e| matches!(e, Event::Disconnection(..))).await;
        assert!(matches!(
            event,
            Event::Disconnection(_, PeerReason::Unreachable)
        ));

        // the server still holds the half open session of the first client
        let mut other = open(secure(Settings::default(), 11)).await;
        other
            .connect_with_key(server.local_addr(), Key([3; 32]))
            .unwrap();
        wait_for(&mut other, |e| matches!(e, Event::Connection(_))).await;

        other.close().await;
        client.close().await;
        server.close().await;
    });
}
