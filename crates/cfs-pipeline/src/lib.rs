#![forbid(unsafe_code)]
//! Component pipeline interfaces for CirrusFS.
//!
//! A pipeline is an ordered chain of [`Component`]s; calls enter at the top
//! (the POSIX-facing surface) and flow towards the storage-facing bottom via
//! each component's `next` pointer. This crate defines the component
//! contract, the open-file [`Handle`], the option structs carried across
//! component boundaries, and a small assembler that wires and drives a chain.
//!
//! Call order for every component: constructor, `set_next_component`,
//! `configure`, `start`, ... , `stop`.

use cfs_error::{CfsError, Result};
use cfs_types::HandleId;
use parking_lot::Mutex;
use serde::Deserialize;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Attributes of a remote file, as reported by the storage-facing component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub path: String,
    pub size: u64,
}

/// Options for [`Component::get_attr`].
#[derive(Debug, Clone)]
pub struct GetAttrOptions {
    pub path: String,
}

/// Options for [`Component::open_file`].
#[derive(Debug, Clone)]
pub struct OpenFileOptions {
    pub path: String,
    pub flags: i32,
}

/// Options for [`Component::read_in_buffer`].
///
/// `data` is filled starting at byte `offset` of the file behind `handle`.
#[derive(Debug)]
pub struct ReadInBufferOptions<'a> {
    pub handle: Arc<Handle>,
    pub offset: u64,
    pub data: &'a mut [u8],
}

/// Options for [`Component::close_file`].
#[derive(Debug, Clone)]
pub struct CloseFileOptions {
    pub handle: Arc<Handle>,
}

/// Top-level pipeline configuration shared by all components.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default, rename = "read-only")]
    pub read_only: bool,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// An open file handle flowing through the pipeline.
///
/// The handle carries identity, the file size observed at open time, and one
/// typed attachment slot a caching component can hang its per-open state on.
/// The slot replaces the string-keyed value bag of classic pipeline designs:
/// the owner attaches a single typed structure and detaches it on close.
pub struct Handle {
    id: HandleId,
    path: String,
    size: u64,
    attachment: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl Handle {
    #[must_use]
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            id: HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)),
            path: path.into(),
            size,
            attachment: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// File size observed at open time. Immutable for a read-only pipeline.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Attach per-open state to this handle, replacing any previous value.
    pub fn attach<T: Any + Send + Sync>(&self, value: Arc<T>) {
        *self.attachment.lock() = Some(value);
    }

    /// Borrow the attached state, if present and of type `T`.
    #[must_use]
    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.attachment.lock();
        slot.clone()?.downcast::<T>().ok()
    }

    /// Remove and return the attached state, if present and of type `T`.
    ///
    /// A value of a different type is left in place.
    #[must_use]
    pub fn detach<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let mut slot = self.attachment.lock();
        let value = slot.take()?;
        match value.downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(original) => {
                *slot = Some(original);
                None
            }
        }
    }
}

/// A pipeline component.
///
/// File operations default to unsupported so that storage-facing components
/// only implement the surface they serve; middle components override and
/// forward what they do not handle themselves.
pub trait Component: Send + Sync {
    /// Stable component name used in configuration and logs.
    fn name(&self) -> &'static str;

    /// Wire the next (storage-facing) component. Called once during assembly,
    /// before `configure`.
    fn set_next_component(&self, next: Arc<dyn Component>);

    /// Validate configuration and build internal state. A configuration error
    /// here is fatal to pipeline creation.
    fn configure(&self, config: &PipelineConfig) -> Result<()>;

    /// Start background machinery. Must not block.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stop background machinery and join any threads. Idempotent.
    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn get_attr(&self, _options: GetAttrOptions) -> Result<FileAttr> {
        Err(CfsError::Unsupported(self.name()))
    }

    fn open_file(&self, _options: OpenFileOptions) -> Result<Arc<Handle>> {
        Err(CfsError::Unsupported(self.name()))
    }

    fn read_in_buffer(&self, _options: ReadInBufferOptions<'_>) -> Result<usize> {
        Err(CfsError::Unsupported(self.name()))
    }

    fn close_file(&self, _options: CloseFileOptions) -> Result<()> {
        Err(CfsError::Unsupported(self.name()))
    }
}

/// An assembled component chain.
///
/// Components are listed top-first. Assembly wires each component to the one
/// after it and configures all of them; `start` brings the chain up from the
/// storage side so that a component never starts before its downstream.
pub struct Pipeline {
    components: Vec<Arc<dyn Component>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("components", &self.components.len())
            .finish()
    }
}

impl Pipeline {
    pub fn assemble(
        components: Vec<Arc<dyn Component>>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        if components.is_empty() {
            return Err(CfsError::InvalidConfig(
                "pipeline requires at least one component".to_owned(),
            ));
        }

        for pair in components.windows(2) {
            pair[0].set_next_component(Arc::clone(&pair[1]));
        }
        for component in &components {
            component.configure(config)?;
            info!(event = "component_configured", component = component.name());
        }

        Ok(Self { components })
    }

    pub fn start(&self) -> Result<()> {
        for component in self.components.iter().rev() {
            component.start()?;
            info!(event = "component_started", component = component.name());
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        for component in &self.components {
            component.stop()?;
            info!(event = "component_stopped", component = component.name());
        }
        Ok(())
    }

    /// The POSIX-facing head of the chain.
    #[must_use]
    pub fn head(&self) -> &Arc<dyn Component> {
        &self.components[0]
    }
}
