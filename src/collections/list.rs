/// Addresses a node of a [`List`].
///
/// A handle outlives the node it points to: once the node is removed its
/// slot is recycled under a new generation, and the stale handle simply
/// stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    generation: u32,
    prev: Option<u32>,
    next: Option<u32>,
}

/// A doubly linked list stored in an arena.
#[derive(Debug)]
pub struct List<T> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<T> List<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn handle(&self, index: u32) -> Handle {
        Handle {
            index,
            generation: self.nodes[index as usize].generation,
        }
    }

    fn node(&self, handle: Handle) -> Option<&Node<T>> {
        self.nodes
            .get(handle.index as usize)
            .filter(|node| node.generation == handle.generation && node.value.is_some())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.node(handle).is_some()
    }

    pub fn push_back(&mut self, value: T) -> Handle {
        let node = Node {
            value: Some(value),
            generation: 0,
            prev: self.tail,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                let generation = self.nodes[index as usize].generation;
                self.nodes[index as usize] = Node { generation, ..node };
                index
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        };
        match self.tail {
            Some(tail) => self.nodes[tail as usize].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        self.handle(index)
    }

    /// Appends every value in order. Returns the handle of the first one.
    pub fn append(&mut self, values: impl IntoIterator<Item = T>) -> Option<Handle> {
        let mut first = None;
        for value in values {
            let handle = self.push_back(value);
            first.get_or_insert(handle);
        }
        first
    }

    pub fn first(&self) -> Option<Handle> {
        self.head.map(|index| self.handle(index))
    }

    pub fn next(&self, handle: Handle) -> Option<Handle> {
        self.node(handle)?.next.map(|index| self.handle(index))
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.node(handle)?.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.nodes
            .get_mut(handle.index as usize)
            .filter(|node| node.generation == handle.generation)
            .and_then(|node| node.value.as_mut())
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let node = self.nodes.get_mut(handle.index as usize)?;
        if node.generation != handle.generation {
            return None;
        }
        let value = node.value.take()?;
        let (prev, next) = (node.prev.take(), node.next.take());
        node.generation = node.generation.wrapping_add(1);

        match prev {
            Some(prev) => self.nodes[prev as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next as usize].prev = prev,
            None => self.tail = prev,
        }
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = &self.nodes[cursor? as usize];
            cursor = node.next;
            node.value.as_ref()
        })
    }

    pub fn clear(&mut self) {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            cursor = self.nodes[index as usize].next;
            let handle = self.handle(index);
            self.remove(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order() {
        let mut list = List::new();
        let a = list.push_back('a');
        list.append(vec!['b', 'c']);
        assert_eq!(list.iter().collect::<String>(), "abc");
        let b = list.next(a).unwrap();
        assert_eq!(list.get(b), Some(&'b'));
        assert_eq!(list.remove(b), Some('b'));
        assert_eq!(list.iter().collect::<String>(), "ac");
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut list = List::new();
        let a = list.push_back(1);
        list.remove(a);
        let b = list.push_back(2);
        // the slot is recycled under a new generation
        assert!(!list.contains(a));
        assert_eq!(list.get(a), None);
        assert_eq!(list.remove(a), None);
        assert_eq!(list.get(b), Some(&2));
        assert_eq!(list.first(), Some(b));
    }

    #[test]
    fn clear_empties_and_invalidates() {
        let mut list = List::new();
        let handles: Vec<_> = (0..4).map(|i| list.push_back(i)).collect();
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.first(), None);
        assert!(handles.iter().all(|h| !list.contains(*h)));
    }
}
