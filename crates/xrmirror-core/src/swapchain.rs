use std::time::Duration;

use tracing::{debug, warn};

use crate::compositor::{Compositor, ImageChain, ImageWait, SwapchainCreateInfo};
use crate::gpu::GpuDevice;
use crate::types::{Extent2D, TextureFormat, ViewDescriptor};
use crate::{XrError, XrResult};

/// One view's image chain and the GPU textures backing it.
///
/// Dropping a `ViewSwapchain` invalidates its textures first and then destroys
/// the chain. It must go before the GPU device that created the textures.
pub struct ViewSwapchain<S, T> {
    // Field order is drop order.
    textures: Vec<T>,
    chain: S,
    format: TextureFormat,
    extent: Extent2D,
    acquired: Option<u32>,
}

impl<S: ImageChain, T> ViewSwapchain<S, T> {
    pub fn create<C, G>(
        compositor: &mut C,
        device: &mut G,
        descriptor: &ViewDescriptor,
    ) -> XrResult<Self>
    where
        G: GpuDevice<Texture = T>,
        C: Compositor<G, Swapchain = S>,
    {
        let info = SwapchainCreateInfo::for_view(descriptor);
        let allocation = compositor.create_swapchain(device, &info)?;
        if allocation.textures.is_empty() {
            return Err(XrError::compositor(
                "xrEnumerateSwapchainImages",
                "image chain has no images",
            ));
        }
        debug!(
            "swapchain created: {}x{} format={} depth={}",
            info.extent.width,
            info.extent.height,
            allocation.format.name(),
            allocation.textures.len()
        );
        Ok(Self {
            textures: allocation.textures,
            chain: allocation.chain,
            format: allocation.format,
            extent: info.extent,
            acquired: None,
        })
    }

    /// Acquires the next image and waits until it can be rendered to.
    ///
    /// With a bounded `timeout`, an expiry is logged and the wait repeated unless
    /// `fatal_on_timeout` is set. Returns the image index and how many expiries
    /// were observed.
    pub fn acquire(
        &mut self,
        timeout: Option<Duration>,
        fatal_on_timeout: bool,
    ) -> XrResult<(u32, u32)> {
        if let Some(index) = self.acquired {
            return Err(XrError::compositor(
                "xrAcquireSwapchainImage",
                format!("image {index} still acquired"),
            ));
        }
        let index = self.chain.acquire_image()?;
        if index as usize >= self.textures.len() {
            // The compositor now expects a release for this image.
            self.acquired = Some(index);
            self.abandon();
            return Err(XrError::compositor(
                "xrAcquireSwapchainImage",
                format!("index {index} outside chain of {}", self.textures.len()),
            ));
        }
        self.acquired = Some(index);

        let mut expiries = 0;
        loop {
            let outcome = match self.chain.wait_image(timeout) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.abandon();
                    return Err(err);
                }
            };
            match outcome {
                ImageWait::Ready => return Ok((index, expiries)),
                ImageWait::TimedOut => {
                    expiries += 1;
                    let waited = timeout.unwrap_or_default();
                    if fatal_on_timeout {
                        self.abandon();
                        return Err(XrError::ImageWaitTimeout(waited));
                    }
                    warn!("swapchain image {index} not ready after {waited:?}, waiting again");
                }
            }
        }
    }

    /// Returns the acquired image to the chain.
    pub fn release(&mut self) -> XrResult<()> {
        if self.acquired.take().is_none() {
            return Ok(());
        }
        self.chain.release_image()
    }

    /// Releases a held image on an error path, logging instead of failing.
    pub fn abandon(&mut self) {
        if let Err(err) = self.release() {
            warn!("failed to release swapchain image: {err}");
        }
    }

    pub fn acquired_index(&self) -> Option<u32> {
        self.acquired
    }

    pub fn texture(&self, index: u32) -> Option<&T> {
        self.textures.get(index as usize)
    }

    pub fn textures(&self) -> &[T] {
        &self.textures
    }

    pub fn chain(&self) -> &S {
        &self.chain
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockCompositor, MockGpu, MockLog, MockSwapchain, MockTexture};

    fn descriptor(width: u32, height: u32) -> ViewDescriptor {
        ViewDescriptor {
            recommended_width: width,
            recommended_height: height,
            max_width: width * 2,
            max_height: height * 2,
            recommended_sample_count: 1,
            max_sample_count: 4,
        }
    }

    fn create(
        compositor: &mut MockCompositor,
        device: &mut MockGpu,
    ) -> ViewSwapchain<MockSwapchain, MockTexture> {
        ViewSwapchain::create(compositor, device, &descriptor(800, 600)).unwrap()
    }

    #[test]
    fn uses_recommended_extent() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone());
        let mut device = MockGpu::new(log.clone());
        let swapchain = create(&mut compositor, &mut device);
        assert_eq!(swapchain.extent(), Extent2D::new(800, 600));
        assert_eq!(swapchain.textures().len(), 3);
        assert!(matches!(
            log.calls()[0],
            MockCall::CreateSwapchain { extent, .. } if extent == Extent2D::new(800, 600)
        ));
    }

    #[test]
    fn double_acquire_is_rejected() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone());
        let mut device = MockGpu::new(log.clone());
        let mut swapchain = create(&mut compositor, &mut device);

        let (index, expiries) = swapchain.acquire(None, false).unwrap();
        assert_eq!((index, expiries), (0, 0));
        assert!(swapchain.acquire(None, false).is_err());
        swapchain.release().unwrap();
        swapchain.release().unwrap();
        assert_eq!(
            log.count(|c| matches!(c, MockCall::ReleaseImage { .. })),
            1
        );
        assert_eq!(swapchain.acquire(None, false).unwrap().0, 1);
    }

    #[test]
    fn bounded_wait_retries_until_ready() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone());
        compositor.set_timeouts_per_wait(2);
        let mut device = MockGpu::new(log.clone());
        let mut swapchain = create(&mut compositor, &mut device);

        let (_, expiries) = swapchain
            .acquire(Some(Duration::from_millis(5)), false)
            .unwrap();
        assert_eq!(expiries, 2);
        assert!(swapchain.acquired_index().is_some());
    }

    #[test]
    fn fatal_timeout_releases_the_image() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone());
        compositor.set_timeouts_per_wait(1);
        let mut device = MockGpu::new(log.clone());
        let mut swapchain = create(&mut compositor, &mut device);

        let err = swapchain
            .acquire(Some(Duration::from_millis(5)), true)
            .unwrap_err();
        assert!(matches!(err, XrError::ImageWaitTimeout(_)));
        assert_eq!(swapchain.acquired_index(), None);
        assert_eq!(
            log.count(|c| matches!(c, MockCall::ReleaseImage { .. })),
            1
        );
    }

    #[test]
    fn chain_depth_sets_texture_count() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone());
        compositor.set_chain_depth(2);
        let mut device = MockGpu::new(log.clone());
        let mut swapchain = create(&mut compositor, &mut device);
        assert_eq!(swapchain.textures().len(), 2);

        let mut indices = Vec::new();
        for _ in 0..3 {
            indices.push(swapchain.acquire(None, false).unwrap().0);
            swapchain.release().unwrap();
        }
        assert_eq!(indices, vec![0, 1, 0]);
    }

    #[test]
    fn index_without_texture_is_released() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone());
        compositor.set_textures_per_chain(Some(1));
        let mut device = MockGpu::new(log.clone());
        let mut swapchain = create(&mut compositor, &mut device);

        assert_eq!(swapchain.acquire(None, false).unwrap().0, 0);
        swapchain.release().unwrap();
        log.clear();

        let err = swapchain.acquire(None, false).unwrap_err();
        assert!(matches!(err, XrError::Compositor { .. }));
        assert_eq!(swapchain.acquired_index(), None);
        assert_eq!(
            log.calls(),
            vec![
                MockCall::AcquireImage {
                    swapchain: swapchain.chain().id(),
                    index: 1
                },
                MockCall::ReleaseImage {
                    swapchain: swapchain.chain().id()
                },
            ]
        );
    }

    #[test]
    fn drop_destroys_chain() {
        let log = MockLog::new();
        let mut compositor = MockCompositor::new(log.clone());
        let mut device = MockGpu::new(log.clone());
        drop(create(&mut compositor, &mut device));
        assert!(matches!(
            log.calls().last(),
            Some(MockCall::DestroySwapchain { .. })
        ));
    }
}
