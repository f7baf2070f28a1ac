//! The operand stack: a LIFO of variable slots that grows on demand.
//!
//! Large value types carry their payload in a tail buffer owned by the slot
//! itself, so a single vector of slots gives the same observable behavior as
//! a variable-width byte stack: `push`/`pop` round-trip exactly, `top` and
//! `nth` walk from the most recent push. Underflow is a fatal engine fault,
//! never a managed exception.

use crate::error::EngineFault;
use crate::value::Variable;

#[derive(Debug, Clone, Default)]
/// Execution stack of one frame.
pub struct VariableStack {
    entries: Vec<Variable>,
}

impl VariableStack {
    /// An empty stack with room for `max_stack` slots.
    pub fn with_capacity(max_stack: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_stack),
        }
    }

    /// True when no slot is pushed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of pushed slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Push a slot.
    pub fn push(&mut self, value: Variable) {
        self.entries.push(value);
    }

    /// Pop the most recent slot.
    pub fn pop(&mut self) -> Result<Variable, EngineFault> {
        self.entries.pop().ok_or(EngineFault::StackUnderflow)
    }

    /// The most recent slot.
    pub fn top(&self) -> Result<&Variable, EngineFault> {
        self.entries.last().ok_or(EngineFault::StackUnderflow)
    }

    /// The `index`-th most recent slot (0 is the top).
    pub fn nth(&self, index: usize) -> Result<&Variable, EngineFault> {
        if index >= self.entries.len() {
            return Err(EngineFault::StackUnderflow);
        }
        Ok(&self.entries[self.entries.len() - 1 - index])
    }

    /// Mutable access to the `index`-th most recent slot.
    pub fn nth_mut(&mut self, index: usize) -> Result<&mut Variable, EngineFault> {
        let len = self.entries.len();
        if index >= len {
            return Err(EngineFault::StackUnderflow);
        }
        Ok(&mut self.entries[len - 1 - index])
    }

    /// Drop every slot.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate all live slots, bottom first. Used by the collector.
    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Value, Variable, VariableDescription};
    use microclr_asm::VariableKind;

    #[test]
    fn push_pop_round_trip() {
        let mut stack = VariableStack::with_capacity(4);
        let before = stack.clone();
        stack.push(Variable::from(42i32));
        assert_eq!(stack.pop().unwrap(), Variable::from(42i32));
        assert_eq!(stack.entries, before.entries);
    }

    #[test]
    fn top_and_nth_walk_from_most_recent() {
        let mut stack = VariableStack::default();
        stack.push(Variable::from(1i32));
        stack.push(Variable::from(2i64));
        stack.push(Variable::from(3.5f64));
        assert_eq!(stack.top().unwrap(), &Variable::from(3.5f64));
        assert_eq!(stack.nth(0).unwrap(), &Variable::from(3.5f64));
        assert_eq!(stack.nth(1).unwrap(), &Variable::from(2i64));
        assert_eq!(stack.nth(2).unwrap(), &Variable::from(1i32));
        assert!(stack.nth(3).is_err());
    }

    #[test]
    fn mixed_width_slots_survive_interleaving() {
        let mut stack = VariableStack::default();
        let big = Variable::zero_of(&VariableDescription::sized(VariableKind::LargeValueType, 24));
        stack.push(Variable::from(7i32));
        stack.push(big.clone());
        stack.push(Variable::from(9i32));
        assert_eq!(stack.pop().unwrap(), Variable::from(9i32));
        assert_eq!(stack.pop().unwrap(), big);
        assert_eq!(stack.pop().unwrap(), Variable::from(7i32));
        assert!(stack.is_empty());
    }

    #[test]
    fn underflow_is_fatal() {
        let mut stack = VariableStack::default();
        assert!(matches!(stack.pop(), Err(EngineFault::StackUnderflow)));
        assert!(matches!(stack.top(), Err(EngineFault::StackUnderflow)));
        stack.push(Variable::new(Value::Empty));
        stack.clear();
        assert!(stack.pop().is_err());
    }
}
