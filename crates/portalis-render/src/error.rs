use std::fmt;

use crate::render_tree::Attachment;

/// Errors produced while allocating or binding render resources.
///
/// None of these abort a frame: callers log them and skip the portal,
/// container or effect that needed the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The backend refused to create a texture.
    TextureAllocation { width: u32, height: u32, class: String },
    /// The backend refused to create a buffer.
    BufferAllocation { label: &'static str, size: u64 },
    /// A render target cannot be bound.
    InvalidRenderTarget { attachment: Attachment, reason: String },
    /// A context's clipper is degenerate.
    InvalidClipper { context: usize },
    /// A shadow split's view slice cannot be projected into light space.
    DegenerateShadowSplit { split: usize },
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::TextureAllocation { width, height, class } => {
                write!(f, "failed to allocate {}x{} texture for cache '{}'", width, height, class)
            }
            RenderError::BufferAllocation { label, size } => {
                write!(f, "failed to allocate {} byte buffer '{}'", size, label)
            }
            RenderError::InvalidRenderTarget { attachment, reason } => {
                write!(f, "invalid {:?} render target: {}", attachment, reason)
            }
            RenderError::InvalidClipper { context } => {
                write!(f, "context {} has a degenerate clipper", context)
            }
            RenderError::DegenerateShadowSplit { split } => {
                write!(f, "shadow split {} does not project into light space", split)
            }
        }
    }
}

impl std::error::Error for RenderError {}

pub type RenderResult<T> = Result<T, RenderError>;
