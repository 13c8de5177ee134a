//! Process-wide runtime state shared by all domains.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::config::{LayoutKind, RuntimeConfig};
use crate::domain::Domain;
use crate::error::RuntimeError;
use crate::fail::ExnIndex;
use crate::frame_table::FrameTable;
use crate::heap::{AllocPath, Heap, Object, OBJECT_TAG};
use crate::ids::DomainId;
use crate::scan::StackLayout;
use crate::value::Value;

/// Predefined exception identifiers, indexed by [`ExnIndex`].
#[derive(Debug, Clone)]
pub struct GlobalData {
    exceptions: Vec<Value>,
}

impl GlobalData {
    pub fn exception(&self, index: ExnIndex) -> Value {
        self.exceptions[index as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    pub id: DomainId,
    pub vm_inited: bool,
}

#[derive(Debug, Default)]
pub struct DomainRegistry {
    domains: RwLock<HashMap<DomainId, DomainInfo>>,
}

impl DomainRegistry {
    pub(crate) fn register(&self, id: DomainId) {
        self.domains.write().insert(
            id,
            DomainInfo {
                id,
                vm_inited: false,
            },
        );
    }

    pub(crate) fn set_vm_inited(&self, id: DomainId, inited: bool) {
        if let Some(info) = self.domains.write().get_mut(&id) {
            info.vm_inited = inited;
        }
    }

    pub(crate) fn remove(&self, id: DomainId) -> Option<DomainInfo> {
        self.domains.write().remove(&id)
    }

    pub fn get(&self, id: DomainId) -> Option<DomainInfo> {
        self.domains.read().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    layout: StackLayout,
    global_data: OnceCell<GlobalData>,
    domains: DomainRegistry,
}

impl Runtime {
    /// Runtime for `config`. A native layout starts with a table holding
    /// only the fiber handler boundaries; use [`Runtime::with_layout`] to
    /// supply the compiled descriptors.
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let layout = match config.layout {
            LayoutKind::Bytecode => StackLayout::Bytecode,
            LayoutKind::Native => StackLayout::Native(FrameTable::new()),
        };
        Self::with_layout(config, layout)
    }

    pub fn with_layout(config: RuntimeConfig, layout: StackLayout) -> Arc<Self> {
        Arc::new(Runtime {
            config,
            layout,
            global_data: OnceCell::new(),
            domains: DomainRegistry::default(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn layout(&self) -> &StackLayout {
        &self.layout
    }

    /// Allocate the predefined exception identifiers. Uses the
    /// non-triggering path: the collector is not running yet.
    pub fn init_global_data(&self, heap: &mut Heap) -> Result<(), RuntimeError> {
        if self.global_data.get().is_some() {
            log::warn!("global data already initialised, keeping the existing table");
            return Ok(());
        }
        let mut exceptions = Vec::with_capacity(ExnIndex::ALL.len());
        for (idx, exn) in ExnIndex::ALL.iter().enumerate() {
            let name = heap.alloc(Object::Str(exn.name().to_string()), AllocPath::NoTrigger)?;
            let id = heap.alloc(
                Object::Block {
                    tag: OBJECT_TAG,
                    fields: vec![Value::block(name), Value::int(-(idx as i64) - 1)],
                },
                AllocPath::NoTrigger,
            )?;
            exceptions.push(Value::block(id));
        }
        if self.global_data.set(GlobalData { exceptions }).is_err() {
            log::warn!("global data initialised concurrently, keeping the existing table");
        }
        log::debug!("registered {} predefined exceptions", ExnIndex::ALL.len());
        Ok(())
    }

    pub fn global_data(&self) -> Option<&GlobalData> {
        self.global_data.get()
    }

    pub fn create_domain(self: &Arc<Self>) -> Domain {
        Domain::new(Arc::clone(self))
    }

    pub fn domain_by_id(&self, id: DomainId) -> Option<DomainInfo> {
        self.domains.get(id)
    }

    pub fn domains(&self) -> &DomainRegistry {
        &self.domains
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("native", &self.layout.is_native())
            .field("global_data", &self.global_data.get().is_some())
            .field("domains", &self.domains.len())
            .finish()
    }
}
