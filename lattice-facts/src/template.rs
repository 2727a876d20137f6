use crate::fact::{Fact, FactError};
use crate::value::{Value, ValueKind};
use serde::{Deserialize, Serialize};

/// One slot of a deftemplate.
///
/// An empty `types` list admits any value. Multislot type constraints apply
/// to each element of the multifield.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDef {
    pub name: String,
    pub multi: bool,
    pub types: Vec<ValueKind>,
    pub default: Option<Value>,
}

impl SlotDef {
    pub fn single(name: &str) -> Self {
        SlotDef {
            name: name.to_string(),
            multi: false,
            types: Vec::new(),
            default: None,
        }
    }

    pub fn multi(name: &str) -> Self {
        SlotDef {
            name: name.to_string(),
            multi: true,
            types: Vec::new(),
            default: None,
        }
    }

    pub fn typed(name: &str, types: Vec<ValueKind>) -> Self {
        SlotDef {
            name: name.to_string(),
            multi: false,
            types,
            default: None,
        }
    }

    fn admits(&self, value: &Value) -> bool {
        if self.types.is_empty() {
            return true;
        }
        self.types.iter().any(|k| k.admits(value))
    }

    fn unfilled(&self) -> Value {
        if let Some(default) = &self.default {
            return default.clone();
        }
        if self.multi {
            Value::Multifield(Vec::new())
        } else {
            Value::nil()
        }
    }
}

/// A deftemplate: the declared shape of template facts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDef {
    pub module: String,
    pub name: String,
    pub slots: Vec<SlotDef>,
}

impl TemplateDef {
    pub fn new(module: &str, name: &str, slots: Vec<SlotDef>) -> Self {
        TemplateDef {
            module: module.to_string(),
            name: name.to_string(),
            slots,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.module, self.name)
    }

    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.name == name)
    }

    pub fn slot(&self, name: &str) -> Option<&SlotDef> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Build a complete template fact from a partial slot assignment.
    ///
    /// Slots come out in declared order; missing slots fill from their
    /// default (symbol `nil` for singles, an empty multifield for
    /// multislots). A bare value given for a multislot is wrapped into a
    /// one-element multifield.
    pub fn realize(&self, given: Vec<(String, Value)>) -> Result<Fact, FactError> {
        let mut filled: Vec<Option<Value>> = vec![None; self.slots.len()];

        for (name, value) in given {
            let index = self.slot_index(&name).ok_or_else(|| FactError::UnknownSlot {
                template: self.qualified_name(),
                slot: name.clone(),
            })?;
            if filled[index].is_some() {
                return Err(FactError::DuplicateSlot {
                    template: self.qualified_name(),
                    slot: name,
                });
            }
            let slot = &self.slots[index];
            let value = self.check_slot_value(slot, value)?;
            filled[index] = Some(value);
        }

        let slots = self
            .slots
            .iter()
            .zip(filled)
            .map(|(slot, value)| {
                (slot.name.clone(), value.unwrap_or_else(|| slot.unfilled()))
            })
            .collect();

        Ok(Fact::Template {
            template: self.qualified_name(),
            slots,
        })
    }

    fn check_slot_value(&self, slot: &SlotDef, value: Value) -> Result<Value, FactError> {
        if slot.multi {
            let items = match value {
                Value::Multifield(items) => items,
                single => vec![single],
            };
            for item in &items {
                if !slot.admits(item) {
                    return Err(self.type_error(slot, item));
                }
            }
            return Ok(Value::Multifield(items));
        }

        if matches!(value, Value::Multifield(_)) {
            return Err(FactError::MultifieldInSingleSlot {
                template: self.qualified_name(),
                slot: slot.name.clone(),
            });
        }
        if !slot.admits(&value) {
            return Err(self.type_error(slot, &value));
        }
        Ok(value)
    }

    fn type_error(&self, slot: &SlotDef, value: &Value) -> FactError {
        let expected = slot
            .types
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(" | ");
        FactError::SlotType {
            template: self.qualified_name(),
            slot: slot.name.clone(),
            value: value.to_string(),
            expected,
        }
    }
}
