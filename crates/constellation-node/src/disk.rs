//! Encrypted state disk

use constellation_common::Result;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// The LUKS-encrypted state disk of a node.
///
/// Callers should go through [`with_open_disk`] so the device is always
/// closed again.
#[cfg_attr(test, automock)]
pub trait EncryptedDisk: Send + Sync {
    /// Open the device
    fn open(&self) -> Result<()>;

    /// Close the device
    fn close(&self) -> Result<()>;

    /// UUID of the encrypted partition
    fn uuid(&self) -> Result<String>;

    /// Replace the initial random passphrase with the permanent key
    fn update_passphrase(&self, passphrase: &[u8]) -> Result<()>;
}

/// Open `disk`, run `f`, and close the disk again whatever `f` returned.
///
/// An error from `f` takes precedence over one from closing.
pub fn with_open_disk<T>(
    disk: &dyn EncryptedDisk,
    f: impl FnOnce(&dyn EncryptedDisk) -> Result<T>,
) -> Result<T> {
    disk.open()?;
    let result = f(disk);
    let closed = disk.close();
    let value = result?;
    if let Err(e) = closed {
        warn!(error = %e, "Closing state disk failed");
        return Err(e);
    }
    Ok(value)
}
