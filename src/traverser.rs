//! Splits a block into loop-respecting sub-blocks.
//!
//! ```text
//!  block:      |------------------ length ------------------|
//!  loop:            [b ............... e)
//!  sub-blocks: |pre |  b .. e (jump)   | b .. (rest)        |
//! ```

use crate::time::{SampleCount, TimeRange};
use crate::transport::{TransportInfo, Transporter};

/// One loop-respecting portion of a block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubBlock {
    /// Transport snapshot; `play` covers exactly this sub-block (empty when stopped).
    pub transport: TransportInfo,
    /// First frame of the sub-block inside the device block.
    pub offset: usize,
    /// Number of frames.
    pub frames: usize,
}

/// Receives each sub-block in order.
pub trait TraversalCallback {
    /// Process one sub-block.
    fn process(&mut self, block: &SubBlock);
}

impl<F: FnMut(&SubBlock)> TraversalCallback for F {
    fn process(&mut self, block: &SubBlock) {
        self(block)
    }
}

/// Summary of one [`Traverser::traverse`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraversalReport {
    /// Sub-blocks handed to the callback.
    pub sub_blocks: usize,
    /// Times the position wrapped from loop end to loop begin.
    pub loop_wraps: usize,
    /// Commits dropped because the position was moved concurrently.
    pub discarded_commits: usize,
}

/// Drives the callback over a block, advancing the transporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct Traverser;

struct Step {
    block_info: TransportInfo,
    frames: SampleCount,
    jump_to: Option<SampleCount>,
}

impl Traverser {
    /// New traverser.
    pub fn new() -> Self {
        Self
    }

    /// Split `length` samples against the live transport state and call
    /// `callback` for each sub-block. The sub-block lengths sum to `length`
    /// and none straddles a loop boundary. Never allocates.
    pub fn traverse<C: TraversalCallback + ?Sized>(
        &self,
        transporter: &Transporter,
        length: usize,
        callback: &mut C,
    ) -> TraversalReport {
        let mut report = TraversalReport::default();
        let mut remaining = length as SampleCount;
        let mut offset = 0usize;

        while remaining > 0 {
            let step = transporter.with_state(|info, map| {
                let begin = info.play.begin.sample;
                if !info.playing {
                    return Step {
                        block_info: *info,
                        frames: remaining,
                        jump_to: None,
                    };
                }
                let (end, jump_to) = if info.is_looping() {
                    let lb = info.loop_range.begin.sample;
                    let le = info.loop_range.end.sample;
                    if begin < lb {
                        ((begin + remaining).min(lb), None)
                    } else if begin < le {
                        let end = (begin + remaining).min(le);
                        (end, (end == le).then_some(lb))
                    } else {
                        (begin + remaining, None)
                    }
                } else {
                    (begin + remaining, None)
                };
                let mut block_info = *info;
                block_info.play = TimeRange::new(info.play.begin, map.point_at_sample(end));
                Step {
                    block_info,
                    frames: end - begin,
                    jump_to,
                }
            });

            let frames = step.frames.max(0) as usize;
            callback.process(&SubBlock {
                transport: step.block_info,
                offset,
                frames,
            });
            report.sub_blocks += 1;
            remaining -= step.frames;
            offset += frames;

            let begin = step.block_info.play.begin.sample;
            let next = match step.jump_to {
                Some(loop_begin) => loop_begin,
                None => step.block_info.play.end.sample,
            };
            if step.block_info.playing {
                if transporter.commit_position(begin, next) {
                    if step.jump_to.is_some() {
                        report.loop_wraps += 1;
                    }
                } else {
                    report.discarded_commits += 1;
                }
            }
        }
        report
    }
}
