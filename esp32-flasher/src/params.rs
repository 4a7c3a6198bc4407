//! Scoped acquisition of register parameter slots.

use crate::error::FlashError;
use crate::target::{Slot, SlotDirection, StubTarget};

/// All parameter slots are 32 bits wide on this target.
const SLOT_WIDTH: u32 = 32;

/// A window of bound parameter slots, released in reverse bind order.
///
/// The debug transport keeps a register window whose entries must be torn
/// down last-in-first-out. `ParamWindow` records bindings in order and
/// [`ParamWindow::release`] unwinds them, so callers never maintain manual
/// symmetric free lists. Slots are addressed by the index `bind` returned.
pub(crate) struct ParamWindow {
    slots: Vec<Slot>,
}

impl ParamWindow {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Binds the named register and returns the slot's index in this
    /// window.
    pub(crate) fn bind<T: StubTarget>(
        &mut self,
        target: &mut T,
        name: &'static str,
        direction: SlotDirection,
    ) -> Result<usize, FlashError> {
        let slot = target
            .bind_register(name, SLOT_WIDTH, direction)
            .map_err(FlashError::Transfer)?;
        self.slots.push(slot);
        Ok(self.slots.len() - 1)
    }

    pub(crate) fn set<T: StubTarget>(
        &mut self,
        target: &mut T,
        index: usize,
        value: u32,
    ) -> Result<(), FlashError> {
        target
            .set_slot(&self.slots[index], value)
            .map_err(FlashError::Transfer)
    }

    pub(crate) fn get<T: StubTarget>(
        &mut self,
        target: &mut T,
        index: usize,
    ) -> Result<u32, FlashError> {
        target
            .get_slot(&self.slots[index])
            .map_err(FlashError::Transfer)
    }

    /// Unbinds every slot in reverse bind order.
    ///
    /// Keeps unwinding past individual failures and reports the first one,
    /// so a broken transport cannot leak the remaining bindings.
    pub(crate) fn release<T: StubTarget>(&mut self, target: &mut T) -> Result<(), FlashError> {
        let mut first_error = None;
        while let Some(slot) = self.slots.pop() {
            if let Err(error) = target.unbind_register(slot) {
                tracing::warn!("failed to unbind parameter slot: {error}");
                first_error.get_or_insert(FlashError::Transfer(error));
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
