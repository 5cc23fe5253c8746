//! Splitting a Markdown file into independently rendered blocks.

use marginalia_engine::BlockId;
use pulldown_cmark::{Event, Options, Parser};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlock {
    pub id: BlockId,
    pub markdown: String,
}

/// One block per top-level Markdown element, in document order. Block ids
/// are positional so that sidecar metadata lines up across runs.
pub fn split_blocks(source: &str) -> Vec<SourceBlock> {
    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    let parser = Parser::new_ext(source, Options::ENABLE_MATH | Options::ENABLE_STRIKETHROUGH);
    for (event, range) in parser.into_offset_iter() {
        match event {
            Event::Start(_) => {
                if depth == 0 {
                    start = range.start;
                }
                depth += 1;
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    push_block(&mut blocks, &source[start..range.end]);
                }
            }
            Event::Rule if depth == 0 => push_block(&mut blocks, &source[range]),
            _ => {}
        }
    }
    blocks
}

fn push_block(blocks: &mut Vec<SourceBlock>, markdown: &str) {
    let markdown = markdown.trim_end();
    if markdown.is_empty() {
        return;
    }
    blocks.push(SourceBlock {
        id: BlockId::new(format!("block-{}", blocks.len())),
        markdown: markdown.to_string(),
    });
}
