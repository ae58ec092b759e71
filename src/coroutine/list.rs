//! Doubly linked lists threaded through slab entries.
//!
//! Entries are addressed by their slab key, so linking and unlinking are
//! O(1) and never alias a raw pointer. An entry is a member of at most one
//! list; its links say which one.

use slab::Slab;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Running,
    Idle,
}

#[derive(Debug, Default)]
pub struct Links {
    prev: Option<usize>,
    next: Option<usize>,
    list: Option<Membership>,
}

impl Links {
    pub fn membership(&self) -> Option<Membership> {
        self.list
    }

    fn is_detached(&self) -> bool {
        self.prev.is_none() && self.next.is_none() && self.list.is_none()
    }
}

/// Implemented by slab entries that carry [`Links`].
pub trait Linked {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

#[derive(Debug)]
pub struct List {
    kind: Membership,
    head: Option<usize>,
    len: usize,
}

impl List {
    pub const fn new(kind: Membership) -> Self {
        List {
            kind,
            head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn push_front<T: Linked>(&mut self, slab: &mut Slab<T>, key: usize) {
        assert!(
            slab[key].links().is_detached(),
            "entry {} is already linked",
            key
        );
        if let Some(head) = self.head {
            slab[head].links_mut().prev = Some(key);
        }
        let links = slab[key].links_mut();
        links.next = self.head;
        links.list = Some(self.kind);
        self.head = Some(key);
        self.len += 1;
    }

    pub fn remove<T: Linked>(&mut self, slab: &mut Slab<T>, key: usize) {
        let links = slab[key].links_mut();
        assert_eq!(
            links.list,
            Some(self.kind),
            "entry {} is not in the {:?} list",
            key,
            self.kind
        );
        let (prev, next) = (links.prev.take(), links.next.take());
        links.list = None;

        match prev {
            Some(prev) => slab[prev].links_mut().next = next,
            None => self.head = next,
        }
        if let Some(next) = next {
            slab[next].links_mut().prev = prev;
        }
        self.len -= 1;
    }

    pub fn pop_front<T: Linked>(&mut self, slab: &mut Slab<T>) -> Option<usize> {
        let head = self.head()?;
        self.remove(slab, head);
        Some(head)
    }

    /// Keys from head to tail.
    #[cfg(test)]
    pub fn iter<'a, T: Linked>(&self, slab: &'a Slab<T>) -> impl Iterator<Item = usize> + 'a {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let key = cursor?;
            cursor = slab[key].links().next;
            Some(key)
        })
    }
}
