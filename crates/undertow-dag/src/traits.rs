// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Chunk-access seams.
//!
//! The B-tree and commit layers are written against these traits so the same
//! code runs over a persistent transaction ([`DagRead`]/[`DagWrite`]) and a
//! lazy one ([`LazyRead`]/[`LazyWrite`]); mutation recovery in particular
//! walks other clients' persistent dags with the exact code the working dag
//! uses.

use async_trait::async_trait;

use crate::chunk::Chunk;
use crate::hash::Hash;
use crate::lazy::{LazyRead, LazyWrite};
use crate::store::{DagRead, DagWrite};
use crate::DagResult;

/// Read access to chunks.
#[async_trait]
pub trait ChunkRead: Send + Sync {
    /// Returns the chunk under `hash`, if present.
    async fn chunk(&self, hash: Hash) -> DagResult<Option<Chunk>>;

    /// Returns the chunk under `hash` or [`crate::DagError::ChunkNotFound`].
    async fn must_chunk(&self, hash: Hash) -> DagResult<Chunk> {
        self.chunk(hash)
            .await?
            .ok_or(crate::DagError::ChunkNotFound(hash))
    }
}

/// Write access to chunks, layered over read access.
pub trait ChunkWrite: ChunkRead {
    /// Stages a chunk for the enclosing transaction.
    fn stage_chunk(&mut self, chunk: Chunk);
}

#[async_trait]
impl ChunkRead for DagRead {
    async fn chunk(&self, hash: Hash) -> DagResult<Option<Chunk>> {
        self.get_chunk(hash).await
    }
}

#[async_trait]
impl ChunkRead for DagWrite {
    async fn chunk(&self, hash: Hash) -> DagResult<Option<Chunk>> {
        self.get_chunk(hash).await
    }
}

impl ChunkWrite for DagWrite {
    fn stage_chunk(&mut self, chunk: Chunk) {
        self.put_chunk(chunk);
    }
}

#[async_trait]
impl ChunkRead for LazyRead {
    async fn chunk(&self, hash: Hash) -> DagResult<Option<Chunk>> {
        self.get_chunk(hash).await
    }
}

#[async_trait]
impl ChunkRead for LazyWrite {
    async fn chunk(&self, hash: Hash) -> DagResult<Option<Chunk>> {
        self.get_chunk(hash).await
    }
}

impl ChunkWrite for LazyWrite {
    fn stage_chunk(&mut self, chunk: Chunk) {
        self.put_chunk(chunk);
    }
}
