use crate::device::Device;

/// Point-in-time copy of the registry, in discovery order.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct Snapshot(pub Vec<Device>);

impl Snapshot {
    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
