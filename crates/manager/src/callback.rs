//! Callback receiving dispatch results

use hwkey_applet::Error;

use crate::key::SecurityKey;

/// Receiver of security key events for one registration
///
/// All methods are invoked on the coordinator thread, one at a time. They
/// must not block on the manager itself (for example by calling
/// [`SecurityKeyManager::flush`](crate::SecurityKeyManager::flush)).
pub trait SecurityKeyCallback: Send {
    /// A security key was connected for this registration
    fn on_security_key_discovered(&mut self, key: SecurityKey);

    /// Connecting to a discovered security key failed
    fn on_security_key_discovery_failed(&mut self, error: Error);

    /// A persistently connected security key went away
    fn on_security_key_disconnected(&mut self, key: SecurityKey);
}
