//! Optimization pass sets
//!
//! A `PassSet` is an ordered group of transforms that can live inside a
//! `LazyModule` and be thawed only when a unit actually asks for it.

use memory::{ModuleClass, ModuleDescriptor, ModulePriority, Thawed};
use std::sync::Arc;

use super::transform::Transform;

#[derive(Clone, Default)]
pub struct PassSet {
    name: String,
    passes: Vec<Arc<dyn Transform>>,
}

impl std::fmt::Debug for PassSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassSet")
            .field("name", &self.name)
            .field("passes", &self.ids())
            .finish()
    }
}

impl PassSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passes: Vec::new(),
        }
    }

    pub fn with_pass(mut self, pass: Arc<dyn Transform>) -> Self {
        self.passes.push(pass);
        self
    }

    pub fn push(&mut self, pass: Arc<dyn Transform>) {
        self.passes.push(pass);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn passes(&self) -> &[Arc<dyn Transform>] {
        &self.passes
    }

    pub fn ids(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Rough footprint used for module memory accounting
    pub fn estimated_bytes(&self) -> u64 {
        let per_pass = std::mem::size_of::<Arc<dyn Transform>>() as u64 + 256;
        self.name.len() as u64 + per_pass * self.passes.len() as u64
    }

    /// Package the set as a thawed module instance
    pub fn into_thawed(self) -> Thawed<PassSet> {
        let bytes = self.estimated_bytes();
        Thawed::new(self, bytes)
    }

    /// ON_DEMAND descriptor for registering a pass set as a lazy module
    pub fn descriptor(id: impl Into<String>) -> ModuleDescriptor {
        ModuleDescriptor::new(id)
            .class(ModuleClass::OnDemand)
            .priority(ModulePriority::Normal)
    }
}
