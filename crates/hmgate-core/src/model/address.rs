// ── Device and channel addresses ──
//
// Channels are addressed `DEVICE:N`; the device root itself has no suffix.

/// Device part of a channel address (`ABC123:1` -> `ABC123`).
pub fn device_address(address: &str) -> &str {
    address.split_once(':').map_or(address, |(device, _)| device)
}

/// Channel number of a channel address, `None` for a device root.
pub fn channel_no(address: &str) -> Option<u32> {
    address
        .split_once(':')
        .and_then(|(_, no)| no.parse().ok())
}

/// Build `DEVICE:N`.
pub fn channel_address(device: &str, channel: u32) -> String {
    format!("{device}:{channel}")
}

/// `true` if `address` is the device itself or one of its channels.
pub fn belongs_to(address: &str, device: &str) -> bool {
    device_address(address) == device
}
