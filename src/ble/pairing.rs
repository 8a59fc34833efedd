//! Pairing request interception.
//!
//! A PIN registered on a peripheral before pairing is injected automatically
//! when the OS raises a pairing request for it. The PIN is consumed by the
//! first request that sees it. The outcome decides which event name the
//! router publishes: a rejected PIN becomes [`BLE_PAIRING_FAILED`], anything
//! else keeps the original pairing request name so interactive flows can
//! take over.

use tracing::{debug, info, warn};

use crate::ble::events::BLE_PAIRING_FAILED;
use crate::peripheral::Peripheral;

/// Result of intercepting one pairing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    /// No PIN was registered; the request is left to the application.
    NoPin,
    /// The PIN was handed to the OS.
    PinSent,
    /// The OS rejected the PIN.
    PinRejected,
}

impl PairingOutcome {
    /// Event name to publish for a request originally named `original`.
    pub fn event_name<'a>(&self, original: &'a str) -> &'a str {
        match self {
            Self::PinRejected => BLE_PAIRING_FAILED,
            Self::NoPin | Self::PinSent => original,
        }
    }
}

/// Injects pre-registered PINs into OS pairing requests.
#[derive(Debug, Default, Clone)]
pub struct PairingInterceptor;

impl PairingInterceptor {
    /// Create an interceptor.
    pub fn new() -> Self {
        Self
    }

    /// Handle a pairing request for `peripheral`.
    pub fn intercept(&self, peripheral: &Peripheral) -> PairingOutcome {
        let pin = match peripheral.take_pairing_pin() {
            Some(pin) if !pin.is_empty() => pin,
            _ => {
                debug!("No pairing PIN registered for {}", peripheral.address());
                return PairingOutcome::NoPin;
            }
        };

        info!("Will attempt to auto-pair {} with registered PIN", peripheral.address());

        if peripheral.native().set_pin(pin.as_bytes()) {
            info!("Auto-pairing PIN sent to {}", peripheral.address());
            PairingOutcome::PinSent
        } else {
            warn!("Auto-pairing PIN rejected for {}", peripheral.address());
            PairingOutcome::PinRejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::events::{EventRouter, PAIRING_REQUEST};
    use crate::ble::mock::FakeDevice;
    use crate::config::ConnectionConfig;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn peripheral(device: &Arc<FakeDevice>) -> Peripheral {
        Peripheral::new(
            device.clone(),
            EventRouter::default(),
            ConnectionConfig::default(),
        )
    }

    #[test]
    fn test_pin_is_consumed_once() {
        let device = FakeDevice::new("AA:BB:CC:DD:EE:01");
        let peripheral = peripheral(&device);
        let interceptor = PairingInterceptor::new();

        peripheral.set_pairing_pin("1234");
        assert_eq!(interceptor.intercept(&peripheral), PairingOutcome::PinSent);
        assert_eq!(interceptor.intercept(&peripheral), PairingOutcome::NoPin);
        assert_eq!(device.pins(), vec![b"1234".to_vec()]);
    }

    #[test]
    fn test_rejected_pin_retags_event() {
        let device = FakeDevice::new("AA:BB:CC:DD:EE:01");
        device.reject_pins();
        let peripheral = peripheral(&device);

        peripheral.set_pairing_pin("0000");
        let outcome = PairingInterceptor::new().intercept(&peripheral);

        assert_eq!(outcome, PairingOutcome::PinRejected);
        assert_eq!(outcome.event_name(PAIRING_REQUEST), BLE_PAIRING_FAILED);
        assert!(!peripheral.has_pairing_pin());
    }

    #[test]
    fn test_no_pin_keeps_event_name() {
        let device = FakeDevice::new("AA:BB:CC:DD:EE:01");
        let peripheral = peripheral(&device);

        let outcome = PairingInterceptor::new().intercept(&peripheral);

        assert_eq!(outcome, PairingOutcome::NoPin);
        assert_eq!(outcome.event_name(PAIRING_REQUEST), PAIRING_REQUEST);
        assert!(device.pins().is_empty());
    }

    #[test]
    fn test_empty_pin_is_ignored() {
        let device = FakeDevice::new("AA:BB:CC:DD:EE:01");
        let peripheral = peripheral(&device);

        peripheral.set_pairing_pin("");
        assert_eq!(PairingInterceptor::new().intercept(&peripheral), PairingOutcome::NoPin);
        assert!(device.pins().is_empty());
    }
}
