use std::fmt::Display;
use termtree::Tree as DisplayTree;

/// Something that can describe itself as a labelled tree, for printing plans
/// and summaries to the operator.
pub trait Render {
    fn render(&self) -> Tree;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tree {
    Branch { label: String, nodes: Vec<Tree> },
    Leaf { label: String },
}

impl Tree {
    pub fn leaf(label: impl Into<String>) -> Self {
        Tree::Leaf {
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Tree::Branch { label, .. } | Tree::Leaf { label } => label,
        }
    }

    pub fn nodes(&self) -> &[Tree] {
        match self {
            Tree::Branch { nodes, .. } => nodes,
            Tree::Leaf { .. } => &[],
        }
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        DisplayTree::<String>::from(self.clone()).fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct TreeBuilder<Label, Nodes> {
    label: Label,
    nodes: Nodes,
}

impl Default for TreeBuilder<(), ()> {
    fn default() -> Self {
        Self {
            label: (),
            nodes: (),
        }
    }
}

impl<Nodes> TreeBuilder<(), Nodes> {
    pub fn label(self, label: impl Into<String>) -> TreeBuilder<String, Nodes> {
        TreeBuilder {
            label: label.into(),
            nodes: self.nodes,
        }
    }
}

impl<Label> TreeBuilder<Label, ()> {
    pub fn nodes(self, nodes: Vec<Tree>) -> TreeBuilder<Label, Vec<Tree>> {
        TreeBuilder {
            label: self.label,
            nodes,
        }
    }
}

impl TreeBuilder<String, ()> {
    pub fn build(self) -> Tree {
        Tree::Leaf { label: self.label }
    }
}

impl TreeBuilder<String, Vec<Tree>> {
    pub fn build(self) -> Tree {
        Tree::Branch {
            label: self.label,
            nodes: self.nodes,
        }
    }
}

impl From<Tree> for DisplayTree<String> {
    fn from(value: Tree) -> Self {
        match value {
            Tree::Branch { label, nodes } => DisplayTree::new(label).with_leaves(nodes),
            Tree::Leaf { label } => DisplayTree::new(label),
        }
    }
}
