/// Broadcast sentinel accepted by every device.
pub const ALL_DEVICES: &str = "All";

/// Whether a message addressed to `target_device_id` applies to this device.
///
/// Every inbound handler checks this before touching local state. A miss is
/// not an error: all devices share one channel namespace.
pub fn should_process(target_device_id: &str, current_device_id: &str) -> bool {
    target_device_id == current_device_id || target_device_id == ALL_DEVICES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_processed() {
        assert!(should_process("dev-A", "dev-A"));
    }

    #[test]
    fn broadcast_is_processed() {
        assert!(should_process(ALL_DEVICES, "dev-A"));
    }

    #[test]
    fn other_device_is_dropped() {
        assert!(!should_process("dev-B", "dev-A"));
        assert!(!should_process("all", "dev-A"));
        assert!(!should_process("", "dev-A"));
    }
}
