//! Mount Table Helpers
//!
//! Idempotent mount/unmount checked against the live mount table.

use crate::error::Result;
use crate::storage::StorageContext;
use tracing::debug;

impl StorageContext {
    /// Whether something is mounted at `target`
    pub async fn is_mounted(&self, target: &str) -> Result<bool> {
        let output = self.run(self.commands.findmnt(target)).await?;
        Ok(output.return_code == 0)
    }

    /// Mount `device` (optionally one subvolume of it) at `target`
    pub async fn ensure_mounted(
        &self,
        device: &str,
        target: &str,
        subvol: Option<&str>,
    ) -> Result<()> {
        if self.is_mounted(target).await? {
            return Ok(());
        }
        self.run(self.commands.mkdir(target)).await?;
        self.run(self.commands.mount(device, target, subvol)).await?;
        debug!(device, target, ?subvol, "mounted");
        Ok(())
    }

    pub async fn ensure_unmounted(&self, target: &str) -> Result<()> {
        if !self.is_mounted(target).await? {
            return Ok(());
        }
        self.run(self.commands.umount(target)).await?;
        debug!(target, "unmounted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::Fixture;

    #[tokio::test]
    async fn test_mount_is_idempotent() {
        let fx = Fixture::new();
        fx.ctx
            .ensure_mounted("/dev/sdb", "/mnt2/pools/p", None)
            .await
            .unwrap();
        fx.ctx
            .ensure_mounted("/dev/sdb", "/mnt2/pools/p", None)
            .await
            .unwrap();

        assert!(fx.runner.is_mounted("/mnt2/pools/p"));
        assert_eq!(fx.runner.calls_matching(&["mount"]).len(), 1);

        fx.ctx.ensure_unmounted("/mnt2/pools/p").await.unwrap();
        fx.ctx.ensure_unmounted("/mnt2/pools/p").await.unwrap();
        assert!(!fx.runner.is_mounted("/mnt2/pools/p"));
        assert_eq!(fx.runner.calls_matching(&["umount"]).len(), 1);
    }
}
