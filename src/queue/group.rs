use crate::options::Strategy;

#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub priority: u32,
    pub slots: u32,
    pub used_slots: u32,
    pub strategy: Strategy,
}

impl Group {
    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        self.used_slots < self.slots
    }
}
