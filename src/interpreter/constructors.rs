//! Exposed constructors API for the [`Interpreter`]

use super::Interpreter;
use crate::constants::ConstantHeap;
use crate::error::EngineFault;
use crate::flash::{FlashMemoryManager, FlashStorage, ImageRoots, SimFlashStorage};
use crate::gc::GarbageCollector;
use crate::hardware::NoHardware;
use crate::registry::SpecialTokens;
use crate::table::SortedTable;

use microclr_asm::StartupFlags;

use std::collections::HashMap;

use tracing::debug;

impl<F: FlashStorage, H> Interpreter<F, H> {
    /// Create an engine over the given flash driver and native-method
    /// hook. The flash header, if valid, is mounted lazily by
    /// [`Self::boot`].
    pub fn with_storage(storage: F, hardware: H) -> Self {
        Self {
            classes: SortedTable::new(),
            methods: SortedTable::new(),
            clauses: SortedTable::new(),
            constants: ConstantHeap::new(),
            special_tokens: SpecialTokens::new(),
            statics: HashMap::new(),
            static_reserve: 0,
            gc: GarbageCollector::new(),
            flash: FlashMemoryManager::new(storage),
            hardware,
            task: None,
            startup_token: 0,
            startup_flags: StartupFlags::empty(),
            pending_class: None,
            pending_roots: ImageRoots::default(),
        }
    }

    /// Cap the managed heap at `limit` bytes of backing memory.
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.gc = GarbageCollector::with_limit(limit);
        self
    }

    /// Publish the root tables of a valid flash image. A missing or
    /// invalid header leaves the engine empty.
    pub(crate) fn mount_flash_image(&mut self) -> Result<(), EngineFault> {
        let Some(header) = self.flash.header().cloned() else {
            return Ok(());
        };
        let roots = header.roots;
        if roots.classes != 0 {
            self.classes.load_from_flash(self.flash.reader_at(roots.classes))?;
        }
        if roots.methods != 0 {
            self.methods.load_from_flash(self.flash.reader_at(roots.methods))?;
        }
        if roots.clauses != 0 {
            self.clauses.load_from_flash(self.flash.reader_at(roots.clauses))?;
        }
        if roots.constants != 0 {
            self.constants
                .table()
                .load_from_flash(self.flash.reader_at(roots.constants))?;
        }
        if roots.special_tokens != 0 {
            let mut reader = self.flash.reader_at(roots.special_tokens);
            self.special_tokens = SpecialTokens::read_from(&mut reader)?;
        }
        self.static_reserve = header.static_vector_size;
        self.startup_token = header.startup_token;
        self.startup_flags = header.startup_flags;
        debug!(
            classes = self.classes.len(),
            methods = self.methods.len(),
            "flash image mounted"
        );
        Ok(())
    }
}

impl Interpreter<SimFlashStorage, NoHardware> {
    /// An engine over simulated flash with no native methods, as used by
    /// tests and the host-side simulator.
    pub fn simulated() -> Self {
        Self::with_storage(SimFlashStorage::default(), NoHardware)
    }
}

impl Default for Interpreter<SimFlashStorage, NoHardware> {
    fn default() -> Self {
        Self::simulated()
    }
}
