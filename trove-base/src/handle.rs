use std::fmt;

/// Identifies one operation tracked by a resource manager.
///
/// `index` addresses a slot in the manager's operation arena. Slots are recycled once their
/// operation is destroyed, so every id also carries the `version` the slot had when the operation
/// was created. The version is bumped when the slot is freed, which makes ids that outlived their
/// operation detectably stale instead of silently aliasing a newer operation.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct OperationId {
    index: u32,
    version: u32,
}

impl OperationId {
    pub fn new(
        index: u32,
        version: u32,
    ) -> Self {
        OperationId { index, version }
    }

    /// An id that never refers to a live operation
    pub fn null() -> Self {
        OperationId {
            index: 0,
            version: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.version == 0
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl fmt::Debug for OperationId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "OperationId({}v{})", self.index, self.version)
    }
}
