// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer allocation against a platform block pool.
//!
//! The pool itself is an external capability behind [`BlockPool`]; this
//! module only pins down the retry contract: a transiently exhausted pool
//! answers [`PoolError::TryAgain`] and the caller retries later, anything
//! else aborts the operation at hand.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use thiserror::Error;

use crate::buffer::Buffer;
use crate::buffer::ImageInfo;

pub const USAGE_CPU_READ: u64 = 1 << 0;
pub const USAGE_CPU_WRITE: u64 = 1 << 1;
pub const USAGE_PROTECTED: u64 = 1 << 2;

/// One allocation handed out by a [`BlockPool`].
#[derive(Clone, Debug)]
pub struct Block {
    pub id: u64,
    pub size: usize,
    pub data: Arc<Mutex<Vec<u8>>>,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is temporarily out of blocks")]
    TryAgain,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Platform block-pool capability (gralloc/ION/blob pools on a real host).
pub trait BlockPool: Send + Sync {
    fn alloc_block(&self, size: usize, usage: u64) -> Result<Block, PoolError>;
    fn free_block(&self, block: Block);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinearBufferAttribute {
    pub size: usize,
    pub usage: u64,
}

/// One-shot allocation request descriptor; never mutated after submission.
pub struct AllocArg {
    pub attr: LinearBufferAttribute,
    /// Consulted with the current live count; reporting over-limit turns
    /// the attempt into [`AllocError::TryAgain`].
    pub limit: Option<Box<dyn Fn(u32) -> bool + Send + Sync>>,
    /// Hint of how many buffers the caller expects to allocate in total.
    pub count_hint: u32,
}

impl AllocArg {
    pub fn new(size: usize, usage: u64) -> Self {
        Self { attr: LinearBufferAttribute { size, usage }, limit: None, count_hint: 0 }
    }
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("invalid allocation argument")]
    InvalidArg,
    #[error("pool is temporarily exhausted, try again later")]
    TryAgain,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The host framework's exchange-buffer type at the component boundary.
pub struct ExchangeBuffer {
    pub block: Block,
    pub image: ImageInfo,
    pub data_len: usize,
    pub timestamp: u64,
}

// Allocation may be requested from several threads, so the live count sits
// behind its own mutex, decremented from Buffer release hooks.
struct AllocCount(Mutex<u32>);

impl AllocCount {
    fn release(&self) {
        let mut count = self.0.lock().unwrap();
        *count = count.saturating_sub(1);
    }
}

/// Allocates pipeline buffers from a [`BlockPool`] and converts between the
/// pipeline's [`Buffer`] and the host's [`ExchangeBuffer`].
pub struct BufferAllocator {
    pool: Arc<dyn BlockPool>,
    count: Arc<AllocCount>,
}

impl BufferAllocator {
    pub fn new(pool: Arc<dyn BlockPool>) -> Self {
        Self { pool, count: Arc::new(AllocCount(Mutex::new(0))) }
    }

    /// Requests a buffer of `arg.attr.size` bytes. The returned buffer is
    /// never smaller than requested.
    pub fn alloc(&self, arg: &AllocArg, image: ImageInfo) -> Result<Arc<Buffer>, AllocError> {
        if arg.attr.size == 0 {
            return Err(AllocError::InvalidArg);
        }

        if let Some(limit) = &arg.limit {
            if limit(self.alloc_count()) {
                log::trace!("allocation over limit at {} live buffers", self.alloc_count());
                return Err(AllocError::TryAgain);
            }
        }

        let block = self.pool.alloc_block(arg.attr.size, arg.attr.usage).map_err(|err| match err
        {
            PoolError::TryAgain => AllocError::TryAgain,
            PoolError::Other(err) => AllocError::Other(err),
        })?;
        if block.size < arg.attr.size {
            self.pool.free_block(block);
            return Err(AllocError::Other(anyhow::anyhow!(
                "pool returned a short block for a {} byte request",
                arg.attr.size
            )));
        }

        *self.count.0.lock().unwrap() += 1;

        let pool = self.pool.clone();
        let count = Arc::downgrade(&self.count);
        Ok(Arc::new(Buffer::with_release(
            block,
            image,
            Box::new(move |block| {
                pool.free_block(block);
                if let Some(count) = Weak::upgrade(&count) {
                    count.release();
                }
            }),
        )))
    }

    /// Releases `buffer` back to the pool. The caller must hold the only
    /// reference at call time; the block returns once that reference drops.
    pub fn free(&self, buffer: Arc<Buffer>) {
        drop(buffer);
    }

    /// Number of live buffers currently tracked, for diagnostics.
    pub fn alloc_count(&self) -> u32 {
        *self.count.0.lock().unwrap()
    }

    /// Wraps a host exchange buffer as a pipeline buffer. The host keeps
    /// ownership of the memory; nothing returns to our pool.
    pub fn import_exchange(&self, xbuf: ExchangeBuffer) -> Result<Arc<Buffer>, AllocError> {
        if xbuf.block.size == 0 {
            return Err(AllocError::InvalidArg);
        }
        let buffer = Buffer::new(xbuf.block, xbuf.image);
        buffer.set_data_len(xbuf.data_len);
        Ok(Arc::new(buffer))
    }

    /// Converts a pipeline buffer into the host exchange type.
    pub fn export_exchange(
        &self,
        buffer: &Buffer,
        timestamp: u64,
    ) -> Result<ExchangeBuffer, AllocError> {
        Ok(ExchangeBuffer {
            block: buffer.block().clone(),
            image: buffer.image(),
            data_len: buffer.data_len(),
            timestamp,
        })
    }
}
