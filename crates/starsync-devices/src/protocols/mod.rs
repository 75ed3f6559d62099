/*!
 * Transport backends.
 *
 * [`alpaca`] is the production HTTP client; [`simulator`] is an explicit
 * in-memory backend for offline demonstration and tests. A backend is
 * chosen when the `Observatory` is constructed; failures never switch
 * backends silently.
 */

pub mod alpaca;
pub mod simulator;

pub use alpaca::HttpTransport;
pub use simulator::SimulatorTransport;
