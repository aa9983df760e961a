//! Protocol-family modules. One module per family; the dispatcher offers
//! each SNAC to the modules registered for its family, and anything nobody
//! claims falls through to the catch-all logger in the dispatcher itself.

pub mod admin;
pub mod buddy;
pub mod chatnav;
pub mod icbm;
pub mod service;

use crate::dispatch::Registry;

/// Register the built-in modules a fresh session starts with.
pub(crate) fn register_defaults(registry: &mut Registry) {
    registry.register(Box::new(service::ServiceModule::default()));
    registry.register(Box::new(buddy::BuddyModule));
    registry.register(Box::new(icbm::IcbmModule));
    registry.register(Box::new(admin::AdminModule));
    registry.register(Box::new(chatnav::ChatNavModule));
}
