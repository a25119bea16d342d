#[cfg(feature = "afc")]
pub mod afc;
#[cfg(feature = "core_device_proxy")]
pub mod core_device_proxy;
#[cfg(feature = "heartbeat")]
pub mod heartbeat;
#[cfg(feature = "installation_proxy")]
pub mod installation_proxy;
pub mod lockdown;
#[cfg(feature = "misagent")]
pub mod misagent;
#[cfg(feature = "rsd")]
pub mod rsd;
