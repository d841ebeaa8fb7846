//! In-memory working set of one raw-vector collection.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RawVectorError {
    #[error("Invalid vector dimensions: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Vector id {vid} is not resident (next vid is {next_vid})")]
    VidOutOfRange { vid: u64, next_vid: u64 },
}

/// Static description of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorMeta {
    pub name: String,
    pub dimension: usize,
}

impl VectorMeta {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
        }
    }

    /// Bytes occupied by one persisted vector.
    pub fn vector_size(&self) -> usize {
        self.dimension * std::mem::size_of::<f32>()
    }
}

/// Flat, append-only array of `dimension`-wide vectors addressed by vid.
///
/// The write lock is held only for the duration of an append or an
/// in-place overwrite, so readers never wait on disk I/O.
#[derive(Debug)]
pub struct MemoryRawVector {
    meta: VectorMeta,
    data: RwLock<Vec<f32>>,
}

impl MemoryRawVector {
    pub fn new(meta: VectorMeta) -> Self {
        Self {
            meta,
            data: RwLock::new(Vec::new()),
        }
    }

    pub fn meta(&self) -> &VectorMeta {
        &self.meta
    }

    pub fn dimension(&self) -> usize {
        self.meta.dimension
    }

    /// Number of resident vectors, which is also the next vid to assign.
    pub fn next_vid(&self) -> u64 {
        let dim = self.meta.dimension.max(1);
        (self.read().len() / dim) as u64
    }

    /// Append a vector and return the vid assigned to it.
    pub fn add(&self, values: &[f32]) -> Result<u64, RawVectorError> {
        self.check_dimension(values)?;
        let mut data = self.write();
        let vid = (data.len() / self.meta.dimension.max(1)) as u64;
        data.extend_from_slice(values);
        Ok(vid)
    }

    /// Copy of the vector stored at `vid`.
    pub fn get(&self, vid: u64) -> Option<Vec<f32>> {
        let data = self.read();
        Self::slot(&data, vid, self.meta.dimension).map(<[f32]>::to_vec)
    }

    /// Run `f` against the vector at `vid` without copying it out.
    pub fn with_vector<R>(&self, vid: u64, f: impl FnOnce(&[f32]) -> R) -> Option<R> {
        let data = self.read();
        Self::slot(&data, vid, self.meta.dimension).map(f)
    }

    /// Overwrite the vector at `vid` in place. Persisting the change is the
    /// caller's job (`RawVectorIo::update`).
    pub fn update(&self, vid: u64, values: &[f32]) -> Result<(), RawVectorError> {
        self.check_dimension(values)?;
        let dim = self.meta.dimension;
        let mut data = self.write();
        let next_vid = (data.len() / dim.max(1)) as u64;
        if vid >= next_vid {
            return Err(RawVectorError::VidOutOfRange { vid, next_vid });
        }
        let start = vid as usize * dim;
        data[start..start + dim].copy_from_slice(values);
        Ok(())
    }

    /// Replace the whole working set, used when reloading from disk.
    pub(crate) fn replace(&self, flat: Vec<f32>) -> Result<(), RawVectorError> {
        let dim = self.meta.dimension;
        if dim == 0 || flat.len() % dim != 0 {
            return Err(RawVectorError::DimensionMismatch {
                expected: dim,
                actual: flat.len(),
            });
        }
        *self.write() = flat;
        Ok(())
    }

    fn check_dimension(&self, values: &[f32]) -> Result<(), RawVectorError> {
        if self.meta.dimension == 0 || values.len() != self.meta.dimension {
            return Err(RawVectorError::DimensionMismatch {
                expected: self.meta.dimension,
                actual: values.len(),
            });
        }
        Ok(())
    }

    fn slot(data: &[f32], vid: u64, dim: usize) -> Option<&[f32]> {
        let start = usize::try_from(vid).ok()?.checked_mul(dim)?;
        data.get(start..start.checked_add(dim)?)
    }

    // A panicking writer cannot leave the flat buffer half-extended, so a
    // poisoned lock still guards consistent data.
    fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}
