use std::fmt;

/// Which allocator produced a buffer, and therefore which copy and release
/// paths are valid for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemorySpace {
    /// No storage. The only space of a default or freed handle.
    #[default]
    Empty,
    /// Addressable by host code only.
    Host,
    /// Addressable by the accelerator only.
    Device,
    /// Addressable from both host and accelerator without a transfer.
    Coherent,
}

impl MemorySpace {
    /// Host code may dereference pointers into this space.
    pub fn is_host_addressable(&self) -> bool {
        matches!(self, MemorySpace::Host | MemorySpace::Coherent)
    }

    pub fn is_empty(&self) -> bool {
        *self == MemorySpace::Empty
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemorySpace::Empty => "empty",
            MemorySpace::Host => "host",
            MemorySpace::Device => "device",
            MemorySpace::Coherent => "coherent",
        })
    }
}

/// The backend copy primitive used for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl TransferKind {
    pub fn touches_device(&self) -> bool {
        !matches!(self, TransferKind::HostToHost)
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferKind::HostToHost => "host-to-host",
            TransferKind::HostToDevice => "host-to-device",
            TransferKind::DeviceToHost => "device-to-host",
            TransferKind::DeviceToDevice => "device-to-device",
        })
    }
}

/// Selects the transfer that copies a `src` buffer into a `dst` buffer.
///
/// Host and coherent memory are both host addressable, so between them a
/// plain local copy suffices. Anything leaving device memory for a host
/// addressable destination goes device-to-host, and anything landing in
/// device memory goes host-to-device unless it already lives there.
///
/// Returns `None` when either side is [`MemorySpace::Empty`].
pub fn transfer_kind(dst: MemorySpace, src: MemorySpace) -> Option<TransferKind> {
    use MemorySpace::*;
    use TransferKind::*;
    match (dst, src) {
        (Host, Host) => Some(HostToHost),
        (Host, Device) => Some(DeviceToHost),
        (Host, Coherent) => Some(HostToHost),

        (Device, Host) => Some(HostToDevice),
        (Device, Device) => Some(DeviceToDevice),
        (Device, Coherent) => Some(HostToDevice),

        (Coherent, Host) => Some(HostToHost),
        (Coherent, Device) => Some(DeviceToHost),
        (Coherent, Coherent) => Some(HostToHost),

        (Empty, _) | (_, Empty) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MemorySpace::*;
    use TransferKind::*;

    #[test]
    fn test_transfer_table() {
        let table = [
            (Host, Host, HostToHost),
            (Host, Device, DeviceToHost),
            (Host, Coherent, HostToHost),
            (Device, Host, HostToDevice),
            (Device, Device, DeviceToDevice),
            (Device, Coherent, HostToDevice),
            (Coherent, Host, HostToHost),
            (Coherent, Device, DeviceToHost),
            (Coherent, Coherent, HostToHost),
        ];
        for (dst, src, kind) in table {
            assert_eq!(transfer_kind(dst, src), Some(kind), "{} <- {}", dst, src);
        }
    }

    #[test]
    fn test_empty_is_noop() {
        for s in [Empty, Host, Device, Coherent] {
            assert_eq!(transfer_kind(Empty, s), None);
            assert_eq!(transfer_kind(s, Empty), None);
        }
    }

    #[test]
    fn test_host_addressable() {
        assert!(Host.is_host_addressable());
        assert!(Coherent.is_host_addressable());
        assert!(!Device.is_host_addressable());
        assert!(!Empty.is_host_addressable());
        assert_eq!(MemorySpace::default(), Empty);
    }
}
