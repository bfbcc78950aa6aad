//! Planar sample FIFO that re-blocks arbitrary capture buffers into codec frames

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct AudioFifo {
    planes: Vec<VecDeque<f32>>,
}

impl AudioFifo {
    pub fn new(channels: usize) -> Self {
        Self {
            planes: vec![VecDeque::new(); channels],
        }
    }

    /// Samples per channel currently buffered
    pub fn len(&self) -> usize {
        self.planes.first().map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one plane per channel; planes must be of equal length
    pub fn push(&mut self, planes: Vec<Vec<f32>>) {
        for (dst, src) in self.planes.iter_mut().zip(planes) {
            dst.extend(src);
        }
    }

    /// Take exactly `n` samples per channel if that many are buffered
    pub fn pop(&mut self, n: usize) -> Option<Vec<Vec<f32>>> {
        if n == 0 || self.len() < n {
            return None;
        }
        Some(
            self.planes
                .iter_mut()
                .map(|plane| plane.drain(..n).collect())
                .collect(),
        )
    }

    /// Take what is left, zero-padded to `n` samples; `None` when empty
    pub fn pop_padded(&mut self, n: usize) -> Option<Vec<Vec<f32>>> {
        if self.is_empty() || n == 0 {
            return None;
        }
        let take = self.len().min(n);
        Some(
            self.planes
                .iter_mut()
                .map(|plane| {
                    let mut out: Vec<f32> = plane.drain(..take).collect();
                    out.resize(n, 0.0);
                    out
                })
                .collect(),
        )
    }
}
