//! Structural validation for ordered indices.

use thiserror::Error;

use crate::{Color, IndexRead};

/// A broken red-black or ordering invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexViolation {
    #[error("root node is red")]
    RedRoot,
    #[error("sentinel is not black")]
    RedSentinel,
    #[error("root has a non-nil parent")]
    RootHasParent,
    #[error("red node with key {key} has a red child")]
    RedChildOfRed { key: u64 },
    #[error("black height differs below key {key}: left {left}, right {right}")]
    BlackHeight { key: u64, left: usize, right: usize },
    #[error("child of key {key} does not link back to it")]
    ParentLink { key: u64 },
    #[error("key {key} follows larger key {previous}")]
    Order { key: u64, previous: u64 },
    #[error("link {link:#x} from {from:#x} does not name a node")]
    BadLink { from: u64, link: u64 },
    #[error("more than {limit} nodes reachable from the root")]
    TooManyNodes { limit: usize },
    #[error("path from the root is deeper than {limit}")]
    TooDeep { limit: usize },
}

pub(crate) fn validate<T: IndexRead + ?Sized>(tree: &T) -> Result<usize, IndexViolation> {
    if tree.color(tree.nil()) != Color::Black {
        return Err(IndexViolation::RedSentinel);
    }
    let root = tree.root();
    if tree.is_nil(root) {
        return Ok(0);
    }
    if tree.color(root) != Color::Black {
        return Err(IndexViolation::RedRoot);
    }
    if !tree.is_nil(tree.parent(root)) {
        return Err(IndexViolation::RootHasParent);
    }

    let mut previous: Option<u64> = None;
    let mut order = Ok(());
    tree.for_each_in_order(|n| {
        let key = tree.key(n);
        match previous {
            Some(prev) if key < prev && order.is_ok() => {
                order = Err(IndexViolation::Order {
                    key,
                    previous: prev,
                });
            }
            _ => {}
        }
        previous = Some(key);
    });
    order?;

    black_height(tree, root)
}

fn black_height<T: IndexRead + ?Sized>(tree: &T, node: T::Ref) -> Result<usize, IndexViolation> {
    if tree.is_nil(node) {
        return Ok(1);
    }
    let key = tree.key(node);
    let (l, r) = (tree.left(node), tree.right(node));
    for child in [l, r] {
        if tree.is_nil(child) {
            continue;
        }
        if tree.parent(child) != node {
            return Err(IndexViolation::ParentLink { key });
        }
        if tree.color(node) == Color::Red && tree.color(child) == Color::Red {
            return Err(IndexViolation::RedChildOfRed { key });
        }
    }
    let left = black_height(tree, l)?;
    let right = black_height(tree, r)?;
    if left != right {
        return Err(IndexViolation::BlackHeight { key, left, right });
    }
    Ok(left + usize::from(tree.color(node) == Color::Black))
}
