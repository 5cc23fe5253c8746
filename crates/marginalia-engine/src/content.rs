//! Block content as a tree of elements, text leaves and inline atoms.
//!
//! A block's text coordinate space is the concatenation of its text leaves in
//! document order. Atoms (typeset math, images, line breaks) take up layout
//! space but contribute no characters, so their asynchronous re-rendering
//! changes geometry without shifting offsets.

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

/// Index of a node in a [`ContentTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Root,
    Paragraph,
    Heading(u8),
    Emphasis,
    Strong,
    Strikethrough,
    Code,
    Link,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AtomKind {
    /// Inline math. Occupies `source` width in cells until typeset, then the
    /// typeset width.
    Math {
        source: String,
        typeset_cells: Option<usize>,
    },
    /// Block-level image. Zero rows until it has loaded.
    Image { src: String, rows: Option<usize> },
    /// Forced line break.
    LineBreak,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Element(ElementKind),
    Text(String),
    Atom(AtomKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Arena-backed content tree for one block.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentTree {
    nodes: Vec<Node>,
}

impl Default for ContentTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                kind: NodeKind::Element(ElementKind::Root),
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    /// A tree with a single paragraph holding `text`.
    pub fn from_text(text: &str) -> Self {
        let mut tree = Self::new();
        let p = tree.push(tree.root(), NodeKind::Element(ElementKind::Paragraph));
        if !text.is_empty() {
            tree.push(p, NodeKind::Text(text.to_string()));
        }
        tree
    }

    /// Parse a Markdown fragment into a content tree.
    ///
    /// Soft breaks become a single space, code spans become text inside a
    /// `Code` element, inline math and images become atoms. Raw HTML is not
    /// rendered and contributes nothing.
    pub fn from_markdown(source: &str) -> Self {
        let mut tree = Self::new();
        let mut stack = vec![tree.root()];
        let mut in_image = 0usize;
        let mut top_level_blocks = 0usize;

        let parser = Parser::new_ext(
            source,
            Options::ENABLE_MATH | Options::ENABLE_STRIKETHROUGH,
        );

        for event in parser {
            let parent = *stack.last().unwrap_or(&NodeId(0));
            match event {
                Event::Start(Tag::Image { dest_url, .. }) => {
                    if in_image == 0 {
                        tree.push(
                            parent,
                            NodeKind::Atom(AtomKind::Image {
                                src: dest_url.to_string(),
                                rows: None,
                            }),
                        );
                    }
                    in_image += 1;
                }
                Event::End(TagEnd::Image) => {
                    in_image = in_image.saturating_sub(1);
                }
                _ if in_image > 0 => {
                    // Alt text is not rendered text
                }
                Event::Start(tag) => {
                    let kind = match tag {
                        Tag::Paragraph => ElementKind::Paragraph,
                        Tag::Heading { level, .. } => ElementKind::Heading(level as u8),
                        Tag::Emphasis => ElementKind::Emphasis,
                        Tag::Strong => ElementKind::Strong,
                        Tag::Strikethrough => ElementKind::Strikethrough,
                        Tag::Link { .. } => ElementKind::Link,
                        _ => ElementKind::Other,
                    };
                    if stack.len() == 1 {
                        if top_level_blocks > 0 {
                            tree.push(parent, NodeKind::Atom(AtomKind::LineBreak));
                        }
                        top_level_blocks += 1;
                    }
                    let id = tree.push(parent, NodeKind::Element(kind));
                    stack.push(id);
                }
                Event::End(_) => {
                    if stack.len() > 1 {
                        stack.pop();
                    }
                }
                Event::Text(text) => {
                    tree.push(parent, NodeKind::Text(text.to_string()));
                }
                Event::Code(code) => {
                    let el = tree.push(parent, NodeKind::Element(ElementKind::Code));
                    tree.push(el, NodeKind::Text(code.to_string()));
                }
                Event::InlineMath(math) | Event::DisplayMath(math) => {
                    tree.push(
                        parent,
                        NodeKind::Atom(AtomKind::Math {
                            source: math.to_string(),
                            typeset_cells: None,
                        }),
                    );
                }
                Event::SoftBreak => {
                    tree.push(parent, NodeKind::Text(" ".to_string()));
                }
                Event::HardBreak | Event::Rule => {
                    tree.push(parent, NodeKind::Atom(AtomKind::LineBreak));
                }
                Event::Html(_)
                | Event::InlineHtml(_)
                | Event::FootnoteReference(_)
                | Event::TaskListMarker(_) => {}
            }
        }

        tree
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn push(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// All leaves (text and atoms) in document order.
    pub fn leaves(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_leaves(self.root(), &mut out);
        out
    }

    fn collect_leaves(&self, id: NodeId, out: &mut Vec<NodeId>) {
        let node = &self.nodes[id.0];
        match node.kind {
            NodeKind::Element(_) => {
                for child in &node.children {
                    self.collect_leaves(*child, out);
                }
            }
            NodeKind::Text(_) | NodeKind::Atom(_) => out.push(id),
        }
    }

    /// Text-bearing leaves in document order, with their text.
    pub fn text_leaves(&self) -> Vec<(NodeId, &str)> {
        self.leaves()
            .into_iter()
            .filter_map(|id| match &self.nodes[id.0].kind {
                NodeKind::Text(t) => Some((id, t.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text content.
    pub fn text(&self) -> String {
        self.text_leaves().into_iter().map(|(_, t)| t).collect()
    }

    /// Number of characters in the concatenated text.
    pub fn text_len(&self) -> usize {
        self.text_leaves()
            .into_iter()
            .map(|(_, t)| t.chars().count())
            .sum()
    }

    /// Number of characters contributed by `id` and its descendants.
    pub fn text_len_of(&self, id: NodeId) -> usize {
        match self.nodes.get(id.0).map(|n| &n.kind) {
            Some(NodeKind::Text(t)) => t.chars().count(),
            Some(NodeKind::Element(_)) => self.nodes[id.0]
                .children
                .iter()
                .map(|c| self.text_len_of(*c))
                .sum(),
            _ => 0,
        }
    }

    /// Atoms of a given shape, in document order.
    pub fn math_atoms(&self) -> Vec<NodeId> {
        self.leaves()
            .into_iter()
            .filter(|id| matches!(self.nodes[id.0].kind, NodeKind::Atom(AtomKind::Math { .. })))
            .collect()
    }

    pub fn image_atoms(&self) -> Vec<NodeId> {
        self.leaves()
            .into_iter()
            .filter(|id| matches!(self.nodes[id.0].kind, NodeKind::Atom(AtomKind::Image { .. })))
            .collect()
    }

    /// Record that a math atom finished typesetting. Returns false when `id`
    /// is not a math atom.
    pub fn set_math_typeset(&mut self, id: NodeId, cells: usize) -> bool {
        match self.nodes.get_mut(id.0).map(|n| &mut n.kind) {
            Some(NodeKind::Atom(AtomKind::Math { typeset_cells, .. })) => {
                *typeset_cells = Some(cells);
                true
            }
            _ => false,
        }
    }

    /// Record that an image finished loading. Returns false when `id` is not
    /// an image atom.
    pub fn set_image_loaded(&mut self, id: NodeId, row_count: usize) -> bool {
        match self.nodes.get_mut(id.0).map(|n| &mut n.kind) {
            Some(NodeKind::Atom(AtomKind::Image { rows, .. })) => {
                *rows = Some(row_count);
                true
            }
            _ => false,
        }
    }
}
