//! Session decorators and the factory that composes them.
//!
//! | Name     | Decorator            |
//! |----------|----------------------|
//! | `safe`   | [`ReliableDelivery`] |
//! | `limits` | [`TrafficCounter`]   |

mod factory;
mod reliable;
mod traffic;

pub use factory::{LIMITS, SAFE, SessionFactory};
pub use reliable::ReliableDelivery;
pub use traffic::{TrafficCounter, Validator, quota_validator};
