//! R-tree backend: SAH-style splits on overflow, STR packing for bulk loads.

use super::BackendKind;
use super::backend::SpatialBackend;
use crate::element::rects_intersect;
use kurbo::Rect;

const MAX_CHILDREN: usize = 8;
const MIN_CHILDREN: usize = 3;

#[derive(Debug, Clone)]
enum Entries {
    Leaf(Vec<(usize, Rect)>),
    Branch(Vec<usize>),
}

impl Entries {
    fn len(&self) -> usize {
        match self {
            Entries::Leaf(items) => items.len(),
            Entries::Branch(children) => children.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct Node {
    bbox: Rect,
    entries: Entries,
}

/// Balanced bounding-box tree over arena-allocated nodes.
#[derive(Debug, Clone, Default)]
pub struct RTree {
    root: Option<usize>,
    nodes: Vec<Node>,
    /// Arena indices of detached nodes, reused before the arena grows.
    free: Vec<usize>,
    len: usize,
}

impl RTree {
    /// Number of stored slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the tree holds no slots.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Height of the tree (0 when empty, 1 for a single leaf).
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.root;
        while let Some(idx) = cursor {
            depth += 1;
            cursor = match &self.nodes[idx].entries {
                Entries::Branch(children) => children.first().copied(),
                Entries::Leaf(_) => None,
            };
        }
        depth
    }

    fn entries_bbox(&self, entries: &Entries) -> Rect {
        let mut rects: Box<dyn Iterator<Item = Rect> + '_> = match entries {
            Entries::Leaf(items) => Box::new(items.iter().map(|&(_, r)| r)),
            Entries::Branch(children) => Box::new(children.iter().map(|&c| self.nodes[c].bbox)),
        };
        let first = rects.next().unwrap_or(Rect::ZERO);
        rects.fold(first, |acc, r| acc.union(r))
    }

    fn push_node(&mut self, entries: Entries) -> usize {
        let node = Node {
            bbox: self.entries_bbox(&entries),
            entries,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release_node(&mut self, idx: usize) {
        self.nodes[idx] = Node {
            bbox: Rect::ZERO,
            entries: Entries::Leaf(Vec::new()),
        };
        self.free.push(idx);
    }

    /// Child with the least area enlargement; smaller area breaks ties.
    fn choose_subtree(&self, children: &[usize], rect: Rect) -> usize {
        let mut best = children[0];
        let mut best_cost = (f64::INFINITY, f64::INFINITY);
        for &child in children {
            let bbox = self.nodes[child].bbox;
            let area = bbox.area();
            let cost = (bbox.union(rect).area() - area, area);
            if cost < best_cost {
                best_cost = cost;
                best = child;
            }
        }
        best
    }

    fn insert_into(&mut self, idx: usize, slot: usize, rect: Rect) -> Option<usize> {
        self.nodes[idx].bbox = self.nodes[idx].bbox.union(rect);

        let target = match &self.nodes[idx].entries {
            Entries::Branch(children) => Some(self.choose_subtree(children, rect)),
            Entries::Leaf(_) => None,
        };

        match target {
            None => {
                if let Entries::Leaf(items) = &mut self.nodes[idx].entries {
                    items.push((slot, rect));
                }
            }
            Some(child) => {
                let Some(sibling) = self.insert_into(child, slot, rect) else {
                    return None;
                };
                if let Entries::Branch(children) = &mut self.nodes[idx].entries {
                    let pos = children
                        .iter()
                        .position(|&c| c == child)
                        .unwrap_or(children.len() - 1);
                    children.insert(pos + 1, sibling);
                }
            }
        }

        if self.nodes[idx].entries.len() > MAX_CHILDREN {
            Some(self.split_node(idx))
        } else {
            None
        }
    }

    /// Split an overflowing node in place; returns the new right sibling.
    fn split_node(&mut self, idx: usize) -> usize {
        let entries = std::mem::replace(&mut self.nodes[idx].entries, Entries::Leaf(Vec::new()));
        let (left, right) = match entries {
            Entries::Leaf(items) => {
                let (l, r) = partition(items, |&(_, rect)| rect);
                (Entries::Leaf(l), Entries::Leaf(r))
            }
            Entries::Branch(children) => {
                let nodes = &self.nodes;
                let (l, r) = partition(children, |&c| nodes[c].bbox);
                (Entries::Branch(l), Entries::Branch(r))
            }
        };
        self.nodes[idx].bbox = self.entries_bbox(&left);
        self.nodes[idx].entries = left;
        self.push_node(right)
    }

    fn remove_from(&mut self, idx: usize, slot: usize, rect: Rect) -> bool {
        if !rects_intersect(&self.nodes[idx].bbox, &rect) {
            return false;
        }

        let children = match &mut self.nodes[idx].entries {
            Entries::Leaf(items) => {
                let Some(pos) = items.iter().position(|&(s, _)| s == slot) else {
                    return false;
                };
                items.swap_remove(pos);
                self.nodes[idx].bbox = self.entries_bbox(&self.nodes[idx].entries);
                return true;
            }
            Entries::Branch(children) => children.clone(),
        };

        let Some(hit) = children
            .into_iter()
            .find(|&child| self.remove_from(child, slot, rect))
        else {
            return false;
        };

        if self.nodes[hit].entries.is_empty() {
            if let Entries::Branch(children) = &mut self.nodes[idx].entries {
                children.retain(|&c| c != hit);
            }
            self.release_node(hit);
        }
        self.nodes[idx].bbox = self.entries_bbox(&self.nodes[idx].entries);
        true
    }
}

impl SpatialBackend for RTree {
    fn kind(&self) -> BackendKind {
        BackendKind::Tree
    }

    fn insert(&mut self, slot: usize, rect: Rect) {
        self.len += 1;
        match self.root {
            None => {
                let root = self.push_node(Entries::Leaf(vec![(slot, rect)]));
                self.root = Some(root);
            }
            Some(root) => {
                if let Some(sibling) = self.insert_into(root, slot, rect) {
                    let new_root = self.push_node(Entries::Branch(vec![root, sibling]));
                    self.root = Some(new_root);
                }
            }
        }
    }

    fn remove(&mut self, slot: usize, rect: Rect) -> bool {
        let Some(root) = self.root else {
            return false;
        };
        if !self.remove_from(root, slot, rect) {
            return false;
        }
        self.len -= 1;

        if self.len == 0 {
            self.clear();
            return true;
        }
        let only_child = match &self.nodes[root].entries {
            Entries::Branch(children) if children.len() == 1 => Some(children[0]),
            _ => None,
        };
        if let Some(child) = only_child {
            self.root = Some(child);
            self.release_node(root);
        }
        true
    }

    fn clear(&mut self) {
        self.root = None;
        self.nodes.clear();
        self.free.clear();
        self.len = 0;
    }

    fn query_rect(&self, rect: Rect, out: &mut Vec<usize>) {
        let Some(root) = self.root else {
            return;
        };
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if !rects_intersect(&node.bbox, &rect) {
                continue;
            }
            match &node.entries {
                Entries::Leaf(items) => out.extend(
                    items
                        .iter()
                        .filter(|(_, bounds)| rects_intersect(bounds, &rect))
                        .map(|&(slot, _)| slot),
                ),
                Entries::Branch(children) => stack.extend_from_slice(children),
            }
        }
    }

    fn bulk_load(&mut self, items: &[(usize, Rect)]) {
        self.clear();
        if items.is_empty() {
            return;
        }
        self.len = items.len();

        let mut level: Vec<usize> = tile(items.to_vec(), |&(_, rect)| rect)
            .into_iter()
            .map(|group| self.push_node(Entries::Leaf(group)))
            .collect();

        while level.len() > 1 {
            let nodes = &self.nodes;
            let groups = tile(level, |&idx| nodes[idx].bbox);
            level = groups
                .into_iter()
                .map(|group| self.push_node(Entries::Branch(group)))
                .collect();
        }
        self.root = level.first().copied();
    }

    fn benefits_from_rebuild(&self) -> bool {
        true
    }

    fn memory_usage(&self) -> usize {
        let entries: usize = self
            .nodes
            .iter()
            .map(|n| match &n.entries {
                Entries::Leaf(items) => items.capacity() * std::mem::size_of::<(usize, Rect)>(),
                Entries::Branch(children) => children.capacity() * std::mem::size_of::<usize>(),
            })
            .sum();
        self.nodes.capacity() * std::mem::size_of::<Node>() + entries
    }

    fn clone_box(&self) -> Box<dyn SpatialBackend> {
        Box::new(self.clone())
    }
}

/// Split `items` in two along whichever axis minimizes
/// `area(left) * |left| + area(right) * |right|`.
fn partition<T: Copy>(items: Vec<T>, rect_of: impl Fn(&T) -> Rect) -> (Vec<T>, Vec<T>) {
    let n = items.len();
    let mut best: Option<(f64, Vec<T>, Vec<T>)> = None;

    if n >= 2 * MIN_CHILDREN {
        for axis in [Axis::X, Axis::Y] {
            let mut sorted = items.clone();
            sorted.sort_by(|a, b| axis.center(rect_of(a)).total_cmp(&axis.center(rect_of(b))));
            let rects: Vec<Rect> = sorted.iter().map(&rect_of).collect();

            let mut prefix = Vec::with_capacity(n);
            let mut acc = rects[0];
            for r in &rects {
                acc = acc.union(*r);
                prefix.push(acc);
            }
            let mut suffix = vec![Rect::ZERO; n];
            let mut acc = rects[n - 1];
            for i in (0..n).rev() {
                acc = acc.union(rects[i]);
                suffix[i] = acc;
            }

            for k in MIN_CHILDREN..=(n - MIN_CHILDREN) {
                let cost = prefix[k - 1].area() * k as f64 + suffix[k].area() * (n - k) as f64;
                if best.as_ref().is_none_or(|(c, _, _)| cost < *c) {
                    best = Some((cost, sorted[..k].to_vec(), sorted[k..].to_vec()));
                }
            }
        }
    }

    match best {
        Some((_, left, right)) => (left, right),
        None => {
            let mut left = items;
            let right = left.split_off(n / 2);
            (left, right)
        }
    }
}

/// Sort-tile-recursive grouping of `items` into runs of at most `MAX_CHILDREN`.
fn tile<T: Copy>(mut items: Vec<T>, rect_of: impl Fn(&T) -> Rect) -> Vec<Vec<T>> {
    let n = items.len();
    let groups = n.div_ceil(MAX_CHILDREN);
    let mut slices = 1;
    while slices * slices < groups {
        slices += 1;
    }

    items.sort_by(|a, b| Axis::X.center(rect_of(a)).total_cmp(&Axis::X.center(rect_of(b))));
    let slice_len = n.div_ceil(slices).max(1);

    let mut out = Vec::with_capacity(groups);
    for slice in items.chunks_mut(slice_len) {
        slice.sort_by(|a, b| Axis::Y.center(rect_of(a)).total_cmp(&Axis::Y.center(rect_of(b))));
        out.extend(slice.chunks(MAX_CHILDREN).map(|chunk| chunk.to_vec()));
    }
    out
}

#[derive(Debug, Clone, Copy)]
enum Axis {
    X,
    Y,
}

impl Axis {
    fn center(self, rect: Rect) -> f64 {
        match self {
            Axis::X => (rect.x0 + rect.x1) * 0.5,
            Axis::Y => (rect.y0 + rect.y1) * 0.5,
        }
    }
}
