//! Render meshes and the shader-variable plumbing they carry.

use std::sync::Arc;

use ahash::AHashMap;
use portalis_core::math::{Mat4, ReversibleTransform, Vec2, Vec3, Vec4};
use portalis_test_utils::{GpuBuffer, GpuTexture};

/// Primitive topology of a render mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeshType {
    #[default]
    Triangles,
    TriangleStrip,
    TriangleFan,
    Lines,
    Points,
}

/// How a mesh interacts with the depth buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZBufMode {
    /// Neither test nor write.
    None,
    /// Write without testing.
    Fill,
    /// Test without writing.
    Test,
    /// Test and write.
    #[default]
    Use,
}

/// Source and destination blend factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixMode {
    pub src: wgpu::BlendFactor,
    pub dst: wgpu::BlendFactor,
}

impl MixMode {
    /// Output replaces the target.
    pub const REPLACE: Self = Self {
        src: wgpu::BlendFactor::One,
        dst: wgpu::BlendFactor::Zero,
    };

    pub const ALPHA: Self = Self {
        src: wgpu::BlendFactor::SrcAlpha,
        dst: wgpu::BlendFactor::OneMinusSrcAlpha,
    };

    pub fn to_blend_state(self) -> wgpu::BlendState {
        let component = wgpu::BlendComponent {
            src_factor: self.src,
            dst_factor: self.dst,
            operation: wgpu::BlendOperation::Add,
        };
        wgpu::BlendState {
            color: component,
            alpha: component,
        }
    }
}

impl Default for MixMode {
    fn default() -> Self {
        Self::REPLACE
    }
}

/// Vertex streams of a mesh.
#[derive(Debug, Clone)]
pub struct BufferHolder {
    pub index: GpuBuffer,
    pub position: GpuBuffer,
    pub texcoord0: GpuBuffer,
}

/// Interned shader variable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderVarName(u32);

impl ShaderVarName {
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Interner mapping shader variable names to compact ids.
#[derive(Debug, Default)]
pub struct ShaderVarStringSet {
    ids: AHashMap<String, ShaderVarName>,
    names: Vec<String>,
}

impl ShaderVarStringSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, registering it on first use.
    pub fn request(&mut self, name: &str) -> ShaderVarName {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = ShaderVarName(self.names.len() as u32);
        self.names.push(name.to_owned());
        self.ids.insert(name.to_owned(), id);
        id
    }

    pub fn get(&self, name: &str) -> Option<ShaderVarName> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: ShaderVarName) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub enum ShaderVariableValue {
    Texture(GpuTexture),
    Buffer(GpuBuffer),
    Float(f32),
    Int(i32),
    Vec2(Vec2),
    Vec4(Vec4),
    Mat4(Mat4),
    /// Indexed by the shader, e.g. one entry per shadow split.
    Array(Vec<ShaderVariableValue>),
}

impl ShaderVariableValue {
    pub fn as_texture(&self) -> Option<&GpuTexture> {
        match self {
            ShaderVariableValue::Texture(texture) => Some(texture),
            _ => None,
        }
    }

    pub fn as_vec4(&self) -> Option<Vec4> {
        match self {
            ShaderVariableValue::Vec4(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            ShaderVariableValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ShaderVariableValue]> {
        match self {
            ShaderVariableValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// A set of shader variable bindings.
#[derive(Debug, Clone, Default)]
pub struct ShaderVariableContext {
    variables: AHashMap<ShaderVarName, ShaderVariableValue>,
}

impl ShaderVariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: ShaderVarName, value: ShaderVariableValue) {
        self.variables.insert(name, value);
    }

    pub fn get(&self, name: ShaderVarName) -> Option<&ShaderVariableValue> {
        self.variables.get(&name)
    }

    pub fn remove(&mut self, name: ShaderVarName) -> Option<ShaderVariableValue> {
        self.variables.remove(&name)
    }

    pub fn clear(&mut self) {
        self.variables.clear();
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShaderVarName, &ShaderVariableValue)> {
        self.variables.iter().map(|(name, value)| (*name, value))
    }
}

/// Opaque reference to a compiled shader, identified by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderHandle(Arc<str>);

impl ShaderHandle {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Material: per-shader-type shaders plus material-level variables.
#[derive(Debug, Clone, Default)]
pub struct Material {
    pub name: String,
    shaders: AHashMap<String, ShaderHandle>,
    pub variables: ShaderVariableContext,
}

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_shader(mut self, shader_type: &str, shader: ShaderHandle) -> Self {
        self.shaders.insert(shader_type.to_owned(), shader);
        self
    }

    pub fn shader(&self, shader_type: &str) -> Option<&ShaderHandle> {
        self.shaders.get(shader_type)
    }
}

/// Everything needed to issue one draw call.
#[derive(Debug, Clone, Default)]
pub struct RenderMesh {
    pub name: String,
    pub material: Option<Arc<Material>>,
    pub mesh_type: MeshType,
    pub buffers: Option<Arc<BufferHolder>>,
    pub z_buf_mode: ZBufMode,
    /// Mesh space ("this") relative to world space ("other").
    pub object_to_world: ReversibleTransform,
    pub index_start: u32,
    pub index_end: u32,
    pub mix_mode: MixMode,
    pub variable_context: ShaderVariableContext,
    /// World-space center used for depth sorting.
    pub bounding_center: Vec3,
}

/// Draw order bucket; lower priorities are drawn first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RenderPriority(pub i32);

impl RenderPriority {
    pub const SKY: Self = Self(-10);
    pub const OBJECT: Self = Self(0);
    pub const PORTAL: Self = Self(5);
    pub const ALPHA: Self = Self(10);
}
