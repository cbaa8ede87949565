// Shader - compilation state and reflected descriptors
//
// Compilation itself belongs to the caller (a shader compiler, a cache, an
// offline blob). The shader runs it on a worker thread and records the
// outcome so pipeline states can tell when it's ready.

use super::definition::{hash_combine, ShaderCompilationState, ShaderStage};
use super::descriptor::Descriptor;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Output of a successful compilation
#[derive(Debug, Clone, Default)]
pub struct CompiledShader {
    pub bytecode: Vec<u32>,
    pub descriptors: Vec<Descriptor>,
}

pub struct Shader {
    name: String,
    stage: ShaderStage,
    defines: BTreeMap<String, String>,
    state: Mutex<ShaderCompilationState>,
    compiled: Mutex<Option<Arc<CompiledShader>>>,
}

impl Shader {
    pub fn new(name: &str, stage: ShaderStage) -> Self {
        Self {
            name: name.to_string(),
            stage,
            defines: BTreeMap::new(),
            state: Mutex::new(ShaderCompilationState::Idle),
            compiled: Mutex::new(None),
        }
    }

    pub fn with_define(mut self, name: &str, value: &str) -> Self {
        self.defines.insert(name.to_string(), value.to_string());
        self
    }

    /// Run `compile` on a worker thread
    ///
    /// # Panics
    /// If a compilation is already in flight.
    pub fn compile_async<F>(self: &Arc<Self>, compile: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() -> Result<CompiledShader> + Send + 'static,
    {
        self.begin_compilation();

        let shader = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("shader_{}", self.name))
            .spawn(move || shader.finish_compilation(compile()));

        spawned.map_err(|e| {
            *self.state.lock() = ShaderCompilationState::Idle;
            e
        })
        .with_context(|| format!("Failed to spawn the compilation of \"{}\"", self.name))
    }

    /// Run `compile` on the calling thread
    pub fn compile<F>(&self, compile: F) -> ShaderCompilationState
    where
        F: FnOnce() -> Result<CompiledShader>,
    {
        self.begin_compilation();
        self.finish_compilation(compile());
        self.state()
    }

    fn begin_compilation(&self) {
        let mut state = self.state.lock();
        assert_ne!(
            *state,
            ShaderCompilationState::Compiling,
            "\"{}\" is already compiling",
            self.name
        );
        *state = ShaderCompilationState::Compiling;
    }

    fn finish_compilation(&self, result: Result<CompiledShader>) {
        let state = match result {
            Ok(compiled) => {
                log::debug!(
                    "Compiled \"{}\" ({} descriptors)",
                    self.name,
                    compiled.descriptors.len()
                );
                *self.compiled.lock() = Some(Arc::new(compiled));
                ShaderCompilationState::Succeeded
            }
            Err(e) => {
                log::error!("Failed to compile \"{}\": {:#}", self.name, e);
                ShaderCompilationState::Failed
            }
        };
        *self.state.lock() = state;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn state(&self) -> ShaderCompilationState {
        *self.state.lock()
    }

    pub fn is_compiling(&self) -> bool {
        self.state() == ShaderCompilationState::Compiling
    }

    pub fn is_compiled(&self) -> bool {
        self.state() == ShaderCompilationState::Succeeded
    }

    /// Last successful compilation
    pub fn compiled(&self) -> Option<Arc<CompiledShader>> {
        self.compiled.lock().clone()
    }

    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.compiled()
            .map(|compiled| compiled.descriptors.clone())
            .unwrap_or_default()
    }

    /// Identity from name, stage and defines
    pub fn hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.defines.hash(&mut hasher);
        hash_combine(hasher.finish(), self.stage.bits() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::definition::DescriptorType;
    use anyhow::anyhow;
    use std::sync::mpsc;

    fn reflected() -> CompiledShader {
        CompiledShader {
            bytecode: vec![0x0723_0203],
            descriptors: vec![Descriptor::from_register(
                "frame",
                DescriptorType::ConstantBuffer,
                0,
                ShaderStage::VERTEX,
            )],
        }
    }

    #[test]
    fn async_compilation_reports_success() {
        let shader = Arc::new(Shader::new("quad_vs", ShaderStage::VERTEX));
        let (tx, rx) = mpsc::channel::<()>();

        let handle = shader
            .compile_async(move || {
                rx.recv()?;
                Ok(reflected())
            })
            .unwrap();
        assert!(shader.is_compiling());

        tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(shader.is_compiled());
        assert_eq!(shader.descriptors().len(), 1);
    }

    #[test]
    fn failures_are_recorded() {
        let shader = Shader::new("broken_ps", ShaderStage::PIXEL);
        let state = shader.compile(|| Err(anyhow!("syntax error")));
        assert_eq!(state, ShaderCompilationState::Failed);
        assert!(shader.compiled().is_none());
        assert!(shader.descriptors().is_empty());
    }

    #[test]
    #[should_panic(expected = "is already compiling")]
    fn overlapping_compilations_are_fatal() {
        let shader = Arc::new(Shader::new("slow_cs", ShaderStage::COMPUTE));
        let (tx, rx) = mpsc::channel::<()>();
        let _handle = shader.compile_async(move || {
            let _ = rx.recv();
            Ok(CompiledShader::default())
        });
        let _keep_alive = tx;
        shader.compile(|| Ok(CompiledShader::default()));
    }

    #[test]
    fn defines_change_the_hash() {
        let plain = Shader::new("light_ps", ShaderStage::PIXEL);
        let shadowed = Shader::new("light_ps", ShaderStage::PIXEL).with_define("SHADOWS", "1");
        assert_ne!(plain.hash(), shadowed.hash());
        assert_eq!(plain.hash(), Shader::new("light_ps", ShaderStage::PIXEL).hash());
    }
}
