//! # Comment tree
//!
//! Turns the flat comment list of one post into a threaded tree. Subtrees made only of
//! deleted comments are dropped; a deleted comment with live replies stays as a placeholder.
//! Threads nested deeper than [`MAX_DEPTH`] are flattened at that level.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use domains::{Comment, PostInfo, Sort, SortField};
use serde::{Deserialize, Serialize};

/// Deepest nesting level kept in a tree; replies below it hang off their ancestor at this level.
pub const MAX_DEPTH: usize = 128;

/// A comment with its replies. `ts` is the newest timestamp in the subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub comment: Comment,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<Node>,
    #[serde(skip)]
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    #[serde(rename = "comments", default)]
    pub nodes: Vec<Node>,
    pub info: PostInfo,
}

impl Tree {
    /// Builds the tree for a single post. `read_only_age` of zero disables age-based
    /// read-only marking.
    pub fn new(comments: Vec<Comment>, sort: Sort, read_only_age: Duration) -> Tree {
        if comments.is_empty() {
            return Tree::default();
        }

        let url = comments[0].locator.url.clone();
        let ids: HashSet<String> = comments.iter().map(|c| c.id.clone()).collect();

        // children keep input order so equal sort keys stay stable
        let mut children: HashMap<String, Vec<Comment>> = HashMap::new();
        let mut roots = Vec::new();
        for comment in comments {
            if comment.parent_id.is_empty() || !ids.contains(&comment.parent_id) || comment.parent_id == comment.id {
                roots.push(comment);
            } else {
                children.entry(comment.parent_id.clone()).or_default().push(comment);
            }
        }

        let mut nodes: Vec<Node> = roots
            .into_iter()
            .filter_map(|root| build_node(root, &mut children))
            .collect();
        sort_nodes(&mut nodes, sort);

        let mut info = PostInfo { url, ..Default::default() };
        collect_info(&nodes, &mut info);
        info.apply_read_only_age(read_only_age, Utc::now());

        Tree { nodes, info }
    }

    /// Total number of nodes, placeholders included.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut pending: Vec<&Node> = self.nodes.iter().collect();
        while let Some(node) = pending.pop() {
            count += 1;
            pending.extend(node.replies.iter());
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A comment whose replies are still being built.
struct Frame {
    comment: Comment,
    pending: VecDeque<Comment>,
    replies: Vec<Node>,
}

impl Frame {
    fn new(comment: Comment, children: &mut HashMap<String, Vec<Comment>>) -> Self {
        let pending = children.remove(&comment.id).unwrap_or_default().into();
        Frame { comment, pending, replies: Vec::new() }
    }

    /// `None` for a droppable (fully deleted) subtree.
    fn finish(self) -> Option<Node> {
        if self.comment.deleted && self.replies.is_empty() {
            return None;
        }
        let ts = self.replies.iter().map(|r| r.ts).fold(self.comment.timestamp, DateTime::max);
        Some(Node { comment: self.comment, replies: self.replies, ts })
    }
}

/// Attaches replies depth-first without recursion.
fn build_node(root: Comment, children: &mut HashMap<String, Vec<Comment>>) -> Option<Node> {
    let mut stack = vec![Frame::new(root, children)];
    loop {
        let depth = stack.len();
        let top = stack.last_mut()?;
        if let Some(child) = top.pending.pop_front() {
            if depth + 1 >= MAX_DEPTH {
                // hoist the child's replies so the chain stops growing here
                top.pending.extend(children.remove(&child.id).unwrap_or_default());
                let leaf = Frame { comment: child, pending: VecDeque::new(), replies: Vec::new() };
                top.replies.extend(leaf.finish());
                continue;
            }
            let frame = Frame::new(child, children);
            stack.push(frame);
            continue;
        }
        let node = stack.pop()?.finish();
        match stack.last_mut() {
            Some(parent) => parent.replies.extend(node),
            None => return node,
        }
    }
}

/// Sorts every level of the tree by the same key.
fn sort_nodes(nodes: &mut [Node], sort: Sort) {
    let mut levels: Vec<&mut [Node]> = vec![nodes];
    while let Some(level) = levels.pop() {
        level.sort_by(|a, b| {
            let ord = compare(a, b, sort.field);
            if sort.descending {
                ord.reverse()
            } else {
                ord
            }
        });
        for node in level {
            levels.push(node.replies.as_mut_slice());
        }
    }
}

fn compare(a: &Node, b: &Node, field: SortField) -> Ordering {
    match field {
        SortField::Time => a.comment.timestamp.cmp(&b.comment.timestamp),
        SortField::Active => a.ts.cmp(&b.ts),
        SortField::Score => a.comment.score.cmp(&b.comment.score),
        SortField::Controversy => a
            .comment
            .controversy
            .partial_cmp(&b.comment.controversy)
            .unwrap_or(Ordering::Equal),
    }
}

fn collect_info(nodes: &[Node], info: &mut PostInfo) {
    let mut pending: Vec<&Node> = nodes.iter().collect();
    while let Some(node) = pending.pop() {
        if !node.comment.deleted {
            info.count += 1;
            let ts = node.comment.timestamp;
            info.first_ts = Some(info.first_ts.map_or(ts, |f| f.min(ts)));
            info.last_ts = Some(info.last_ts.map_or(ts, |l| l.max(ts)));
        }
        pending.extend(node.replies.iter());
    }
}

/// Sorts a flat list with the same keys the tree uses (`active` falls back to time).
pub fn sort_comments(comments: &mut [Comment], sort: Sort) {
    comments.sort_by(|a, b| {
        let ord = match sort.field {
            SortField::Time | SortField::Active => a.timestamp.cmp(&b.timestamp),
            SortField::Score => a.score.cmp(&b.score),
            SortField::Controversy => a.controversy.partial_cmp(&b.controversy).unwrap_or(Ordering::Equal),
        };
        if sort.descending {
            ord.reverse()
        } else {
            ord
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::Locator;

    fn comment(id: &str, parent: &str, deleted: bool, minutes: i64) -> Comment {
        Comment {
            id: id.into(),
            parent_id: parent.into(),
            deleted,
            text: if deleted { String::new() } else { format!("text {id}") },
            locator: Locator::new("site", "url"),
            timestamp: DateTime::from_timestamp(1_700_000_000 + minutes * 60, 0).unwrap(),
            ..Default::default()
        }
    }

    fn ids(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.comment.id.as_str()).collect()
    }

    #[test]
    fn prunes_deleted_subtrees() {
        let input = vec![
            comment("1", "", false, 1),
            comment("11", "1", false, 2),
            comment("111", "11", false, 3),
            comment("112", "11", true, 4),
            comment("1121", "112", true, 5),
            comment("2", "", false, 6),
            comment("21", "2", true, 7),
            comment("211", "21", true, 8),
            comment("22", "2", false, 9),
            comment("221", "22", false, 10),
            comment("3", "", true, 11),
        ];
        let tree = Tree::new(input, Sort::default(), Duration::zero());

        assert_eq!(ids(&tree.nodes), vec!["1", "2"]);
        let one = &tree.nodes[0];
        assert_eq!(ids(&one.replies), vec!["11"]);
        assert_eq!(ids(&one.replies[0].replies), vec!["111"]);
        let two = &tree.nodes[1];
        assert_eq!(ids(&two.replies), vec!["22"]);
        assert_eq!(ids(&two.replies[0].replies), vec!["221"]);
        assert_eq!(tree.len(), 6);
        assert_eq!(tree.info.count, 6);
        assert_eq!(tree.info.url, "url");
    }

    #[test]
    fn deleted_parent_with_live_reply_is_kept() {
        let input = vec![comment("1", "", true, 1), comment("11", "1", false, 2)];
        let tree = Tree::new(input, Sort::default(), Duration::zero());
        assert_eq!(ids(&tree.nodes), vec!["1"]);
        assert_eq!(ids(&tree.nodes[0].replies), vec!["11"]);
        assert_eq!(tree.info.count, 1);
    }

    #[test]
    fn orphans_become_roots() {
        let input = vec![comment("1", "", false, 1), comment("5", "missing", false, 2)];
        let tree = Tree::new(input, Sort::default(), Duration::zero());
        assert_eq!(ids(&tree.nodes), vec!["1", "5"]);
    }

    #[test]
    fn sorts_by_activity() {
        let input = vec![
            comment("1", "", false, 1),
            comment("2", "", false, 2),
            comment("11", "1", false, 30),
        ];
        let tree = Tree::new(input.clone(), "-active".parse().unwrap(), Duration::zero());
        assert_eq!(ids(&tree.nodes), vec!["1", "2"]);
        assert_eq!(tree.nodes[0].ts, input[2].timestamp);

        let tree = Tree::new(input, "-time".parse().unwrap(), Duration::zero());
        assert_eq!(ids(&tree.nodes), vec!["2", "1"]);
    }

    #[test]
    fn sorts_by_score_stably() {
        let mut a = comment("a", "", false, 1);
        let mut b = comment("b", "", false, 2);
        let c = comment("c", "", false, 3);
        a.score = 5;
        b.score = 5;
        let tree = Tree::new(vec![a, b, c], "score".parse().unwrap(), Duration::zero());
        assert_eq!(ids(&tree.nodes), vec!["a", "b", "c"]);
    }

    #[test]
    fn replies_follow_the_sort_key() {
        let mut low = comment("low", "r", false, 2);
        low.score = 1;
        low.controversy = 3.0;
        let mut high = comment("high", "r", false, 3);
        high.score = 9;
        high.controversy = 1.0;
        let mut deep_a = comment("a", "high", false, 4);
        deep_a.score = -2;
        let mut deep_b = comment("b", "high", false, 5);
        deep_b.score = 4;
        let input = vec![comment("r", "", false, 1), low, high, deep_a, deep_b];

        let tree = Tree::new(input.clone(), "-score".parse().unwrap(), Duration::zero());
        assert_eq!(ids(&tree.nodes[0].replies), vec!["high", "low"]);
        assert_eq!(ids(&tree.nodes[0].replies[0].replies), vec!["b", "a"]);

        let tree = Tree::new(input.clone(), "+score".parse().unwrap(), Duration::zero());
        assert_eq!(ids(&tree.nodes[0].replies), vec!["low", "high"]);
        assert_eq!(ids(&tree.nodes[0].replies[1].replies), vec!["a", "b"]);

        let tree = Tree::new(input, "-controversy".parse().unwrap(), Duration::zero());
        assert_eq!(ids(&tree.nodes[0].replies), vec!["low", "high"]);
    }

    #[test]
    fn deep_threads_are_flattened() {
        let total = 10_000;
        let input: Vec<Comment> = (0..total)
            .map(|i| {
                let parent = if i == 0 { String::new() } else { format!("c{}", i - 1) };
                comment(&format!("c{i}"), &parent, false, i as i64)
            })
            .collect();
        let tree = Tree::new(input, Sort::default(), Duration::zero());

        assert_eq!(tree.len(), total);
        assert_eq!(tree.info.count, total);
        let mut depth = 1;
        let mut node = &tree.nodes[0];
        while node.replies.len() == 1 {
            depth += 1;
            node = &node.replies[0];
        }
        // the last nested level holds the rest of the chain as siblings
        assert_eq!(depth, MAX_DEPTH - 1);
        assert_eq!(node.replies.len(), total - (MAX_DEPTH - 1));
        assert!(node.replies.iter().all(|r| r.replies.is_empty()));
        assert_eq!(node.replies.last().map(|r| r.comment.id.clone()), Some(format!("c{}", total - 1)));
    }

    #[test]
    fn empty_input() {
        let tree = Tree::new(vec![], Sort::default(), Duration::days(1));
        assert_eq!(tree, Tree::default());
        assert_eq!(tree.info.count, 0);
    }

    #[test]
    fn read_only_by_age() {
        let tree = Tree::new(vec![comment("1", "", false, 1)], Sort::default(), Duration::days(1));
        assert!(tree.info.read_only);
        assert!(tree.info.first_ts.is_some());
    }

    #[test]
    fn building_is_idempotent() {
        let input = vec![comment("1", "", false, 1), comment("11", "1", false, 2), comment("2", "", true, 3)];
        let first = Tree::new(input.clone(), Sort::default(), Duration::zero());
        let second = Tree::new(input, Sort::default(), Duration::zero());
        assert_eq!(first, second);
    }
}
