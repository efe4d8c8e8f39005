use tracing::debug;

use crate::compositor::Compositor;
use crate::gpu::GpuDevice;
use crate::types::{Pose, ReferenceSpaceKind};
use crate::XrResult;

/// Fixed anchor frame all view poses are located against.
///
/// Created with an identity anchor and never mutated; the compositor space is
/// destroyed when this is dropped.
pub struct ReferenceSpace<P> {
    handle: P,
    kind: ReferenceSpaceKind,
    anchor: Pose,
}

impl<P> ReferenceSpace<P> {
    pub fn create<C, G>(compositor: &mut C, kind: ReferenceSpaceKind) -> XrResult<Self>
    where
        G: GpuDevice,
        C: Compositor<G, Space = P>,
    {
        let anchor = Pose::IDENTITY;
        let handle = compositor.create_reference_space(kind, anchor)?;
        debug!("reference space created: {kind:?}");
        Ok(Self {
            handle,
            kind,
            anchor,
        })
    }

    pub fn handle(&self) -> &P {
        &self.handle
    }

    pub fn kind(&self) -> ReferenceSpaceKind {
        self.kind
    }

    pub fn anchor(&self) -> Pose {
        self.anchor
    }
}
