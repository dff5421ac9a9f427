use core::mem::size_of;

use tracing::{debug, trace};

use crate::error::{CtcError, Result};

/// Scratch memory for one loss invocation.
///
/// The buffer is exclusively borrowed by [`CtcEngine::compute`](super::CtcEngine::compute)
/// and released when the workspace is dropped, on success and error paths alike.
#[derive(Debug)]
pub struct Workspace {
    buffer: Vec<f32>,
}

impl Workspace {
    /// Allocate at least `bytes` bytes of scratch memory.
    pub fn allocate(bytes: usize) -> Result<Self> {
        let len = bytes.div_ceil(size_of::<f32>());
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|source| CtcError::Allocation { bytes, source })?;
        buffer.resize(len, 0.0);

        debug!(bytes, "allocated ctc workspace");

        Ok(Self { buffer })
    }

    pub fn size_in_bytes(&self) -> usize {
        self.buffer.len() * size_of::<f32>()
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.buffer
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        trace!(bytes = self.size_in_bytes(), "released ctc workspace");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_allocate_rounds_up() {
        let mut workspace = Workspace::allocate(10).unwrap();
        assert_eq!(workspace.size_in_bytes(), 12);
        assert!(workspace.as_mut_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_allocation_failure() {
        let err = Workspace::allocate(usize::MAX).unwrap_err();
        assert!(matches!(err, CtcError::Allocation { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);
    }
}
