use tracing::{info, warn};

use crate::compositor::{Compositor, ImageChain};
use crate::gpu::GpuDevice;
use crate::swapchain::ViewSwapchain;
use crate::types::{View, ViewConfiguration, ViewDescriptor};
use crate::{XrError, XrResult};

/// Every view's swapchain plus its per-frame pose, indexed by view.
///
/// `swapchains`, `views` and `descriptors` always have the same length, fixed
/// for one renderable-session entry.
pub struct ViewSet<S, T> {
    swapchains: Vec<ViewSwapchain<S, T>>,
    views: Vec<View>,
    descriptors: Vec<ViewDescriptor>,
}

impl<S: ImageChain, T> ViewSet<S, T> {
    /// Enumerates view descriptors and creates one swapchain per view.
    ///
    /// Either every swapchain is created or none survive: on failure the ones
    /// already created are released before the error is returned.
    pub fn create<C, G>(
        compositor: &mut C,
        device: &mut G,
        configuration: ViewConfiguration,
    ) -> XrResult<Self>
    where
        G: GpuDevice<Texture = T>,
        C: Compositor<G, Swapchain = S>,
    {
        let descriptors = enumerate_descriptors::<C, G>(compositor, configuration)?;

        let mut swapchains = Vec::with_capacity(descriptors.len());
        for (view, descriptor) in descriptors.iter().enumerate() {
            match ViewSwapchain::create(compositor, device, descriptor) {
                Ok(swapchain) => swapchains.push(swapchain),
                Err(source) => {
                    warn!(
                        "swapchain for view {view} failed ({source}), releasing {} created",
                        swapchains.len()
                    );
                    drop(swapchains);
                    return Err(XrError::SwapchainCreation {
                        view,
                        source: Box::new(source),
                    });
                }
            }
        }

        Ok(Self {
            views: vec![View::default(); swapchains.len()],
            swapchains,
            descriptors,
        })
    }

    pub fn len(&self) -> usize {
        self.swapchains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swapchains.is_empty()
    }

    pub fn swapchain(&self, index: usize) -> Option<&ViewSwapchain<S, T>> {
        self.swapchains.get(index)
    }

    pub fn swapchain_mut(&mut self, index: usize) -> Option<&mut ViewSwapchain<S, T>> {
        self.swapchains.get_mut(index)
    }

    pub fn swapchains(&self) -> &[ViewSwapchain<S, T>] {
        &self.swapchains
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    /// Pose storage written once per frame by the frame coordinator.
    pub fn views_mut(&mut self) -> &mut [View] {
        &mut self.views
    }

    pub fn descriptors(&self) -> &[ViewDescriptor] {
        &self.descriptors
    }

    /// Swapchain and current pose of one view, borrowed together.
    pub fn parts_mut(&mut self, index: usize) -> Option<(&mut ViewSwapchain<S, T>, &View)> {
        let swapchain = self.swapchains.get_mut(index)?;
        let view = self.views.get(index)?;
        Some((swapchain, view))
    }

    /// Releases any image still held, e.g. after an aborted frame.
    pub fn abandon_all(&mut self) {
        for swapchain in &mut self.swapchains {
            swapchain.abandon();
        }
    }
}

/// Size query followed by a fill; the second call's count is authoritative.
fn enumerate_descriptors<C, G>(
    compositor: &mut C,
    configuration: ViewConfiguration,
) -> XrResult<Vec<ViewDescriptor>>
where
    G: GpuDevice,
    C: Compositor<G>,
{
    let required = compositor.enumerate_views(configuration, None)?;
    let mut descriptors = vec![ViewDescriptor::default(); required];
    let written = compositor.enumerate_views(configuration, Some(&mut descriptors))?;
    if written != required {
        warn!("view count changed between enumeration calls: {required} -> {written}");
    }
    descriptors.truncate(written);

    for (i, d) in descriptors.iter().enumerate() {
        info!(
            "view {i}: max {}x{} (max samples {}), recommended {}x{} (samples {})",
            d.max_width,
            d.max_height,
            d.max_sample_count,
            d.recommended_width,
            d.recommended_height,
            d.recommended_sample_count
        );
    }
    if descriptors.is_empty() {
        info!("compositor reports no views, mirror-only mode");
    }
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockCompositor, MockGpu, MockLog, MockSwapchain, MockTexture};
    use crate::types::Extent2D;

    type MockViewSet = ViewSet<MockSwapchain, MockTexture>;

    fn build(compositor: &mut MockCompositor, log: &MockLog) -> XrResult<MockViewSet> {
        let mut device = MockGpu::new(log.clone());
        ViewSet::create(compositor, &mut device, ViewConfiguration::PrimaryStereo)
    }

    #[test]
    fn one_swapchain_per_view() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone()).with_views(2, Extent2D::new(1024, 768));
        let views = build(&mut compositor, &log).unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views.views().len(), 2);
        assert_eq!(views.descriptors().len(), 2);
        assert!(views
            .swapchains()
            .iter()
            .all(|s| s.extent() == Extent2D::new(1024, 768)));
    }

    #[test]
    fn second_enumeration_count_wins() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone()).with_views(2, Extent2D::new(64, 64));
        compositor.set_second_call_count(1);
        let views = build(&mut compositor, &log).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(
            log.count(|c| matches!(c, MockCall::CreateSwapchain { .. })),
            1
        );
    }

    #[test]
    fn zero_views_is_not_an_error() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone());
        let views = build(&mut compositor, &log).unwrap();
        assert!(views.is_empty());
        assert!(views.views().is_empty());
    }

    #[test]
    fn partial_creation_is_rolled_back() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone()).with_views(4, Extent2D::new(64, 64));
        compositor.fail_swapchain_at(2);
        let err = build(&mut compositor, &log).err().unwrap();
        assert!(matches!(err, XrError::SwapchainCreation { view: 2, .. }));

        let created: Vec<u32> = log
            .calls()
            .iter()
            .filter_map(|c| match c {
                MockCall::CreateSwapchain { swapchain, .. } => Some(*swapchain),
                _ => None,
            })
            .collect();
        let destroyed: Vec<u32> = log
            .calls()
            .iter()
            .filter_map(|c| match c {
                MockCall::DestroySwapchain { swapchain } => Some(*swapchain),
                _ => None,
            })
            .collect();
        assert_eq!(created.len(), 2);
        assert_eq!(destroyed.len(), 2);
        assert!(created.iter().all(|id| destroyed.contains(id)));
    }

    #[test]
    fn abandon_all_releases_held_images() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone()).with_views(2, Extent2D::new(64, 64));
        let mut views = build(&mut compositor, &log).unwrap();
        views.swapchain_mut(0).unwrap().acquire(None, false).unwrap();
        views.abandon_all();
        assert!(views.swapchains().iter().all(|s| s.acquired_index().is_none()));
        assert_eq!(
            log.count(|c| matches!(c, MockCall::ReleaseImage { .. })),
            1
        );
    }
}
