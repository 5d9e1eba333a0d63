use std::cmp::Ordering;
use std::sync::Arc;

/// Ordering function shared by a map and every map derived from it.
///
/// Stored behind an `Arc` so cloning a map (or taking a snapshot of it) is
/// O(1) and so key types are not required to implement `Ord` themselves;
/// query-dependent document orderings supply their own comparator.
pub type Comparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Color {
    Red,
    Black,
}

/// Node of the left-leaning red-black tree. `Empty` doubles as the shared
/// leaf sentinel; interior nodes share unmodified subtrees between map
/// versions via `Arc`.
enum Node<K, V> {
    Empty,
    Inner {
        key: K,
        value: V,
        color: Color,
        left: Arc<Node<K, V>>,
        right: Arc<Node<K, V>>,
        size: usize,
    },
}

impl<K, V> Node<K, V> {
    fn is_red(&self) -> bool {
        matches!(
            self,
            Node::Inner {
                color: Color::Red,
                ..
            }
        )
    }

    fn size(&self) -> usize {
        match self {
            Node::Empty => 0,
            Node::Inner { size, .. } => *size,
        }
    }
}

impl<K: Clone, V: Clone> Node<K, V> {
    fn new(
        key: K,
        value: V,
        color: Color,
        left: Arc<Node<K, V>>,
        right: Arc<Node<K, V>>,
    ) -> Arc<Node<K, V>> {
        let size = left.size() + right.size() + 1;
        Arc::new(Node::Inner {
            key,
            value,
            color,
            left,
            right,
            size,
        })
    }

    fn with_color(node: &Arc<Node<K, V>>, color: Color) -> Arc<Node<K, V>> {
        match node.as_ref() {
            Node::Empty => Arc::clone(node),
            Node::Inner {
                key,
                value,
                left,
                right,
                ..
            } => Node::new(
                key.clone(),
                value.clone(),
                color,
                Arc::clone(left),
                Arc::clone(right),
            ),
        }
    }
}

/// An immutable, persistent ordered map.
///
/// `insert` and `remove` return a new map that shares all unmodified
/// subtrees with the original, so previously returned maps are never
/// mutated. Underlies every cache and index in the engine, which is why
/// map/set membership here always comes with a meaningful key ordering.
pub struct SortedMap<K, V> {
    root: Arc<Node<K, V>>,
    comparator: Comparator<K>,
}

impl<K, V> Clone for SortedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: Arc::clone(&self.root),
            comparator: Arc::clone(&self.comparator),
        }
    }
}

impl<K: Ord + Clone + 'static, V: Clone> SortedMap<K, V> {
    /// Creates an empty map ordered by the key type's `Ord`.
    pub fn new() -> Self {
        Self::with_comparator(Arc::new(|a: &K, b: &K| a.cmp(b)))
    }
}

impl<K: Ord + Clone + 'static, V: Clone> Default for SortedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone, V: Clone> SortedMap<K, V> {
    /// Creates an empty map with an explicit ordering.
    pub fn with_comparator(comparator: Comparator<K>) -> Self {
        Self {
            root: Arc::new(Node::Empty),
            comparator,
        }
    }

    pub fn comparator(&self) -> Comparator<K> {
        Arc::clone(&self.comparator)
    }

    pub fn is_empty(&self) -> bool {
        self.root.size() == 0
    }

    pub fn len(&self) -> usize {
        self.root.size()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let mut node = self.root.as_ref();
        loop {
            match node {
                Node::Empty => return None,
                Node::Inner {
                    key: k,
                    value,
                    left,
                    right,
                    ..
                } => match (self.comparator)(key, k) {
                    Ordering::Less => node = left.as_ref(),
                    Ordering::Greater => node = right.as_ref(),
                    Ordering::Equal => return Some(value),
                },
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Returns the number of keys strictly less than `key`, which is the
    /// index `key` has (or would have) in the in-order traversal.
    pub fn index_of(&self, key: &K) -> usize {
        let mut index = 0;
        let mut node = self.root.as_ref();
        loop {
            match node {
                Node::Empty => return index,
                Node::Inner {
                    key: k,
                    left,
                    right,
                    ..
                } => match (self.comparator)(key, k) {
                    Ordering::Less => node = left.as_ref(),
                    Ordering::Greater => {
                        index += left.size() + 1;
                        node = right.as_ref();
                    }
                    Ordering::Equal => return index + left.size(),
                },
            }
        }
    }

    pub fn min_key(&self) -> Option<&K> {
        let mut node = self.root.as_ref();
        let mut result = None;
        while let Node::Inner { key, left, .. } = node {
            result = Some(key);
            node = left.as_ref();
        }
        result
    }

    pub fn max_key(&self) -> Option<&K> {
        let mut node = self.root.as_ref();
        let mut result = None;
        while let Node::Inner { key, right, .. } = node {
            result = Some(key);
            node = right.as_ref();
        }
        result
    }

    /// Returns a new map with `key` bound to `value`; the receiver is
    /// unchanged.
    pub fn insert(&self, key: K, value: V) -> Self {
        let root = insert_node(&self.root, key, value, &self.comparator);
        Self {
            root: Node::with_color(&root, Color::Black),
            comparator: Arc::clone(&self.comparator),
        }
    }

    /// Returns a new map without `key`; the receiver is unchanged. Removing
    /// an absent key returns an equivalent map.
    pub fn remove(&self, key: &K) -> Self {
        if !self.contains_key(key) {
            return self.clone();
        }
        let root = remove_node(&self.root, key, &self.comparator);
        let root = match root.as_ref() {
            Node::Empty => root,
            Node::Inner { .. } => Node::with_color(&root, Color::Black),
        };
        Self {
            root,
            comparator: Arc::clone(&self.comparator),
        }
    }

    /// In-order iteration over the whole map.
    pub fn iter(&self) -> SortedMapIter<'_, K, V> {
        SortedMapIter::new(&self.root, None, &self.comparator, false)
    }

    /// In-order iteration starting at the first key >= `from`.
    pub fn iter_from<'a>(&'a self, from: &'a K) -> SortedMapIter<'a, K, V> {
        SortedMapIter::new(&self.root, Some(from), &self.comparator, false)
    }

    /// Reverse-order iteration over the whole map.
    pub fn iter_reverse(&self) -> SortedMapIter<'_, K, V> {
        SortedMapIter::new(&self.root, None, &self.comparator, true)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    /// Test-only structural check: verifies the red-black invariants and
    /// returns the black-depth of the tree.
    #[cfg(test)]
    pub(crate) fn check(&self) -> usize {
        fn check_node<K, V>(node: &Node<K, V>) -> usize {
            match node {
                Node::Empty => 1,
                Node::Inner {
                    color,
                    left,
                    right,
                    ..
                } => {
                    assert!(
                        !(*color == Color::Red && left.is_red()),
                        "red node with red left child"
                    );
                    assert!(!right.is_red(), "right-leaning red link");
                    let left_depth = check_node(left.as_ref());
                    let right_depth = check_node(right.as_ref());
                    assert_eq!(left_depth, right_depth, "unequal black depth");
                    left_depth + if *color == Color::Black { 1 } else { 0 }
                }
            }
        }
        check_node(self.root.as_ref())
    }
}

impl<K: Clone, V: Clone + PartialEq> SortedMap<K, V> {
    /// Structural equality under this map's ordering.
    pub fn equals(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.iter().zip(other.iter()).all(|((k1, v1), (k2, v2))| {
            (self.comparator)(k1, k2) == Ordering::Equal && v1 == v2
        })
    }
}

fn insert_node<K: Clone, V: Clone>(
    node: &Arc<Node<K, V>>,
    key: K,
    value: V,
    comparator: &Comparator<K>,
) -> Arc<Node<K, V>> {
    match node.as_ref() {
        Node::Empty => Node::new(
            key,
            value,
            Color::Red,
            Arc::new(Node::Empty),
            Arc::new(Node::Empty),
        ),
        Node::Inner {
            key: k,
            value: v,
            color,
            left,
            right,
            ..
        } => {
            let updated = match comparator(&key, k) {
                Ordering::Less => Node::new(
                    k.clone(),
                    v.clone(),
                    *color,
                    insert_node(left, key, value, comparator),
                    Arc::clone(right),
                ),
                Ordering::Greater => Node::new(
                    k.clone(),
                    v.clone(),
                    *color,
                    Arc::clone(left),
                    insert_node(right, key, value, comparator),
                ),
                Ordering::Equal => Node::new(
                    key,
                    value,
                    *color,
                    Arc::clone(left),
                    Arc::clone(right),
                ),
            };
            fix_up(updated)
        }
    }
}

fn remove_node<K: Clone, V: Clone>(
    node: &Arc<Node<K, V>>,
    key: &K,
    comparator: &Comparator<K>,
) -> Arc<Node<K, V>> {
    let mut n = Arc::clone(node);
    match comparator(key, node_key(&n)) {
        Ordering::Less => {
            if !left_of(&n).is_red() && !left_of(left_of(&n)).is_red() {
                n = move_red_left(&n);
            }
            let new_left = remove_node(left_of(&n), key, comparator);
            fix_up(replace_children(&n, new_left, Arc::clone(right_of(&n))))
        }
        _ => {
            if left_of(&n).is_red() {
                n = rotate_right(&n);
            }
            if comparator(key, node_key(&n)) == Ordering::Equal
                && matches!(right_of(&n).as_ref(), Node::Empty)
            {
                return Arc::new(Node::Empty);
            }
            if !right_of(&n).is_red() && !left_of(right_of(&n)).is_red() {
                n = move_red_right(&n);
            }
            if comparator(key, node_key(&n)) == Ordering::Equal {
                let (min_key, min_value) = min_entry(right_of(&n));
                let new_right = remove_min(right_of(&n));
                let rebuilt = Node::new(
                    min_key,
                    min_value,
                    node_color(&n),
                    Arc::clone(left_of(&n)),
                    new_right,
                );
                fix_up(rebuilt)
            } else {
                let new_right = remove_node(right_of(&n), key, comparator);
                fix_up(replace_children(&n, Arc::clone(left_of(&n)), new_right))
            }
        }
    }
}

fn remove_min<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    if matches!(left_of(node).as_ref(), Node::Empty) {
        return Arc::new(Node::Empty);
    }
    let mut n = Arc::clone(node);
    if !left_of(&n).is_red() && !left_of(left_of(&n)).is_red() {
        n = move_red_left(&n);
    }
    let new_left = remove_min(left_of(&n));
    fix_up(replace_children(&n, new_left, Arc::clone(right_of(&n))))
}

fn min_entry<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> (K, V) {
    match node.as_ref() {
        Node::Empty => unreachable!("min_entry on empty subtree"),
        Node::Inner {
            key, value, left, ..
        } => {
            if matches!(left.as_ref(), Node::Empty) {
                (key.clone(), value.clone())
            } else {
                min_entry(left)
            }
        }
    }
}

fn fix_up<K: Clone, V: Clone>(node: Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut n = node;
    if right_of(&n).is_red() && !left_of(&n).is_red() {
        n = rotate_left(&n);
    }
    if left_of(&n).is_red() && left_of(left_of(&n)).is_red() {
        n = rotate_right(&n);
    }
    if left_of(&n).is_red() && right_of(&n).is_red() {
        n = color_flip(&n);
    }
    n
}

fn rotate_left<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let right = Arc::clone(right_of(node));
    let new_left = Node::new(
        node_key(node).clone(),
        node_value(node).clone(),
        Color::Red,
        Arc::clone(left_of(node)),
        Arc::clone(left_of(&right)),
    );
    Node::new(
        node_key(&right).clone(),
        node_value(&right).clone(),
        node_color(node),
        new_left,
        Arc::clone(right_of(&right)),
    )
}

fn rotate_right<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let left = Arc::clone(left_of(node));
    let new_right = Node::new(
        node_key(node).clone(),
        node_value(node).clone(),
        Color::Red,
        Arc::clone(right_of(&left)),
        Arc::clone(right_of(node)),
    );
    Node::new(
        node_key(&left).clone(),
        node_value(&left).clone(),
        node_color(node),
        Arc::clone(left_of(&left)),
        new_right,
    )
}

fn color_flip<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let flipped = |c: Color| match c {
        Color::Red => Color::Black,
        Color::Black => Color::Red,
    };
    Node::new(
        node_key(node).clone(),
        node_value(node).clone(),
        flipped(node_color(node)),
        Node::with_color(left_of(node), flipped(node_color(left_of(node)))),
        Node::with_color(right_of(node), flipped(node_color(right_of(node)))),
    )
}

fn move_red_left<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut n = color_flip(node);
    if left_of(right_of(&n)).is_red() {
        let new_right = rotate_right(right_of(&n));
        n = replace_children(&n, Arc::clone(left_of(&n)), new_right);
        n = rotate_left(&n);
        n = color_flip(&n);
    }
    n
}

fn move_red_right<K: Clone, V: Clone>(node: &Arc<Node<K, V>>) -> Arc<Node<K, V>> {
    let mut n = color_flip(node);
    if left_of(left_of(&n)).is_red() {
        n = rotate_right(&n);
        n = color_flip(&n);
    }
    n
}

fn replace_children<K: Clone, V: Clone>(
    node: &Arc<Node<K, V>>,
    left: Arc<Node<K, V>>,
    right: Arc<Node<K, V>>,
) -> Arc<Node<K, V>> {
    Node::new(
        node_key(node).clone(),
        node_value(node).clone(),
        node_color(node),
        left,
        right,
    )
}

fn node_key<K, V>(node: &Arc<Node<K, V>>) -> &K {
    match node.as_ref() {
        Node::Inner { key, .. } => key,
        Node::Empty => unreachable!("key of empty node"),
    }
}

fn node_value<K, V>(node: &Arc<Node<K, V>>) -> &V {
    match node.as_ref() {
        Node::Inner { value, .. } => value,
        Node::Empty => unreachable!("value of empty node"),
    }
}

fn node_color<K, V>(node: &Arc<Node<K, V>>) -> Color {
    match node.as_ref() {
        Node::Inner { color, .. } => *color,
        Node::Empty => Color::Black,
    }
}

fn left_of<K, V>(node: &Arc<Node<K, V>>) -> &Arc<Node<K, V>> {
    match node.as_ref() {
        Node::Inner { left, .. } => left,
        Node::Empty => unreachable!("left of empty node"),
    }
}

fn right_of<K, V>(node: &Arc<Node<K, V>>) -> &Arc<Node<K, V>> {
    match node.as_ref() {
        Node::Inner { right, .. } => right,
        Node::Empty => unreachable!("right of empty node"),
    }
}

/// In-order (or reverse) iterator; optionally bounded below by a start key.
pub struct SortedMapIter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    reverse: bool,
}

impl<'a, K, V> SortedMapIter<'a, K, V> {
    fn new(
        root: &'a Arc<Node<K, V>>,
        start_at: Option<&K>,
        comparator: &Comparator<K>,
        reverse: bool,
    ) -> Self {
        let mut stack = Vec::new();
        let mut node = root.as_ref();
        loop {
            match node {
                Node::Empty => break,
                Node::Inner {
                    key, left, right, ..
                } => {
                    let cmp = match start_at {
                        Some(start) => comparator(key, start),
                        None => {
                            if reverse {
                                Ordering::Less
                            } else {
                                Ordering::Greater
                            }
                        }
                    };
                    match (cmp, reverse) {
                        (Ordering::Equal, _) => {
                            stack.push(node);
                            break;
                        }
                        (Ordering::Greater, false) | (Ordering::Less, true) => {
                            stack.push(node);
                            node = if reverse { right.as_ref() } else { left.as_ref() };
                        }
                        _ => {
                            node = if reverse { left.as_ref() } else { right.as_ref() };
                        }
                    }
                }
            }
        }
        Self { stack, reverse }
    }
}

impl<'a, K, V> Iterator for SortedMapIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        match node {
            Node::Empty => None,
            Node::Inner {
                key,
                value,
                left,
                right,
                ..
            } => {
                let mut descend = if self.reverse {
                    left.as_ref()
                } else {
                    right.as_ref()
                };
                while let Node::Inner { left, right, .. } = descend {
                    self.stack.push(descend);
                    descend = if self.reverse {
                        right.as_ref()
                    } else {
                        left.as_ref()
                    };
                }
                Some((key, value))
            }
        }
    }
}

impl<K: std::fmt::Debug + Clone, V: std::fmt::Debug + Clone> std::fmt::Debug for SortedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
