use std::fmt;
use std::sync::Arc;

/// A shared wgpu device and queue.
///
/// # Ownership Pattern
///
/// ```rust,no_run
/// use portalis_render::GraphicsContext;
///
/// let ctx = GraphicsContext::new_owned_sync().expect("no GPU available");
/// let ctx2 = ctx.clone(); // Cheap clone (Arc)
/// ```
pub struct GraphicsContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

/// Failure to bring up a GPU device.
#[derive(Debug)]
pub enum GraphicsContextError {
    NoAdapter(wgpu::RequestAdapterError),
    DeviceRequest(wgpu::RequestDeviceError),
}

impl fmt::Display for GraphicsContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphicsContextError::NoAdapter(err) => write!(f, "no suitable GPU adapter: {}", err),
            GraphicsContextError::DeviceRequest(err) => write!(f, "failed to create device: {}", err),
        }
    }
}

impl std::error::Error for GraphicsContextError {}

/// Options for [`GraphicsContext::new_owned_with_descriptor`].
#[derive(Debug, Clone)]
pub struct GraphicsContextDescriptor {
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
    pub label: Option<&'static str>,
}

impl Default for GraphicsContextDescriptor {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::all(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            label: Some("portalis device"),
        }
    }
}

impl GraphicsContext {
    /// Creates a new graphics context.
    pub async fn new_owned() -> Result<Arc<Self>, GraphicsContextError> {
        Self::new_owned_with_descriptor(GraphicsContextDescriptor::default()).await
    }

    /// Creates a new graphics context, blocking the current thread.
    pub fn new_owned_sync() -> Result<Arc<Self>, GraphicsContextError> {
        pollster::block_on(Self::new_owned())
    }

    pub async fn new_owned_with_descriptor(
        descriptor: GraphicsContextDescriptor,
    ) -> Result<Arc<Self>, GraphicsContextError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: descriptor.backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: descriptor.power_preference,
                compatible_surface: None,
                force_fallback_adapter: descriptor.force_fallback_adapter,
            })
            .await
            .map_err(GraphicsContextError::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: descriptor.label,
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(GraphicsContextError::DeviceRequest)?;

        tracing::info!("Created graphics context on {}", adapter.get_info().name);

        Ok(Arc::new(Self {
            instance,
            adapter,
            device,
            queue,
        }))
    }

    /// Get device info
    pub fn info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    /// Get device limits
    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }
}
