use crate::render_mesh::ShaderHandle;

/// One shader pass over all meshes of a context.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderLayer {
    pub name: String,
    /// Material shader type looked up for meshes in this layer.
    pub shader_type: String,
    /// Used when a material has no shader of `shader_type`.
    pub default_shader: Option<ShaderHandle>,
}

impl RenderLayer {
    pub fn new(name: impl Into<String>, shader_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shader_type: shader_type.into(),
            default_shader: None,
        }
    }

    pub fn with_default_shader(mut self, shader: ShaderHandle) -> Self {
        self.default_shader = Some(shader);
        self
    }
}

/// Ordered list of render layers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderLayerConfig {
    layers: Vec<RenderLayer>,
}

impl RenderLayerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single layer using the `base` shader type.
    pub fn single(default_shader: Option<ShaderHandle>) -> Self {
        let mut layer = RenderLayer::new("base", "base");
        layer.default_shader = default_shader;
        Self { layers: vec![layer] }
    }

    pub fn add_layer(&mut self, layer: RenderLayer) -> usize {
        self.layers.push(layer);
        self.layers.len() - 1
    }

    pub fn layer(&self, index: usize) -> Option<&RenderLayer> {
        self.layers.get(index)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenderLayer> {
        self.layers.iter()
    }
}
