#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::LsblkDriveDiscovery as PlatformDriveDiscovery;

#[cfg(target_os = "linux")]
pub use linux::SystemCommandRunner as PlatformCommandRunner;

#[cfg(target_os = "linux")]
pub use linux::StatvfsSpaceProbe as PlatformSpaceProbe;

#[cfg(not(target_os = "linux"))]
compile_error!("ferry-platform manages Linux block devices and only builds on Linux");
