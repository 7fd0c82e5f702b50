pub mod discovery;
pub mod runner;
pub mod space;

pub use discovery::LsblkDriveDiscovery;
pub use runner::SystemCommandRunner;
pub use space::StatvfsSpaceProbe;
