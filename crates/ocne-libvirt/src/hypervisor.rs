//! Hypervisor client
//!
//! The provisioner only needs a small slice of libvirt: domains, one network
//! description, storage pools and volumes. [`Hypervisor`] is that slice;
//! [`VirshHypervisor`] implements it by driving `virsh` against a session URI.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use ocne_common::command::Cmd;
use ocne_common::Result;

/// Timeout for volume uploads
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Operations the provisioner performs against a hypervisor
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Names of every defined domain
    async fn list_domains(&self) -> Result<Vec<String>>;

    /// Define a domain from XML
    async fn define_domain(&self, xml: &str) -> Result<()>;

    /// Start a defined domain
    async fn start_domain(&self, name: &str) -> Result<()>;

    /// Ask a domain to shut down
    async fn shutdown_domain(&self, name: &str) -> Result<()>;

    /// Power off a domain
    async fn destroy_domain(&self, name: &str) -> Result<()>;

    /// Remove a domain definition
    async fn undefine_domain(&self, name: &str) -> Result<()>;

    /// XML description of a network
    async fn network_xml(&self, name: &str) -> Result<String>;

    /// Names of every pool, active or not
    async fn list_pools(&self) -> Result<Vec<String>>;

    /// Names of active pools
    async fn list_active_pools(&self) -> Result<Vec<String>>;

    /// XML description of a pool
    async fn pool_xml(&self, name: &str) -> Result<String>;

    /// Define, build and start a pool from XML
    async fn create_pool(&self, name: &str, xml: &str) -> Result<()>;

    /// Rescan a pool's volumes
    async fn refresh_pool(&self, name: &str) -> Result<()>;

    /// Volume names in a pool
    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>>;

    /// Path of a volume on the hypervisor host
    async fn volume_path(&self, pool: &str, name: &str) -> Result<String>;

    /// Create a volume from XML
    async fn create_volume(&self, pool: &str, xml: &str) -> Result<()>;

    /// Stream a local file into a volume
    async fn upload_volume(&self, pool: &str, name: &str, file: &Path) -> Result<()>;

    /// Delete a volume
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()>;
}

/// [`Hypervisor`] backed by `virsh`
#[derive(Clone, Debug)]
pub struct VirshHypervisor {
    uri: String,
}

impl VirshHypervisor {
    /// A client for `uri`
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    fn virsh(&self) -> Cmd {
        Cmd::new("virsh").args(["-q", "-c", self.uri.as_str()])
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.virsh().args(args).output().await
    }

    async fn run_with_xml(&self, args: &[&str], xml: &str) -> Result<String> {
        self.virsh()
            .args(args)
            .arg("/dev/stdin")
            .stdin(xml.as_bytes().to_vec())
            .output()
            .await
    }
}

/// Non-empty lines of `--name` style output
pub fn parse_names(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Volume names from `virsh -q vol-list` output
pub fn parse_volume_table(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|l| l.split_whitespace().next())
        .filter(|n| !n.starts_with('-') && *n != "Name")
        .map(String::from)
        .collect()
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn list_domains(&self) -> Result<Vec<String>> {
        Ok(parse_names(&self.run(&["list", "--all", "--name"]).await?))
    }

    async fn define_domain(&self, xml: &str) -> Result<()> {
        self.run_with_xml(&["define"], xml).await?;
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        self.run(&["start", name]).await?;
        debug!(domain = name, "Started domain");
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.run(&["shutdown", name]).await?;
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> Result<()> {
        self.run(&["destroy", name]).await?;
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> Result<()> {
        self.run(&["undefine", "--nvram", name]).await?;
        Ok(())
    }

    async fn network_xml(&self, name: &str) -> Result<String> {
        self.run(&["net-dumpxml", name]).await
    }

    async fn list_pools(&self) -> Result<Vec<String>> {
        Ok(parse_names(&self.run(&["pool-list", "--all", "--name"]).await?))
    }

    async fn list_active_pools(&self) -> Result<Vec<String>> {
        Ok(parse_names(&self.run(&["pool-list", "--name"]).await?))
    }

    async fn pool_xml(&self, name: &str) -> Result<String> {
        self.run(&["pool-dumpxml", name]).await
    }

    async fn create_pool(&self, name: &str, xml: &str) -> Result<()> {
        self.run_with_xml(&["pool-define"], xml).await?;
        self.run(&["pool-build", name]).await?;
        self.run(&["pool-start", name]).await?;
        self.run(&["pool-autostart", name]).await?;
        Ok(())
    }

    async fn refresh_pool(&self, name: &str) -> Result<()> {
        self.run(&["pool-refresh", name]).await?;
        Ok(())
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        Ok(parse_volume_table(&self.run(&["vol-list", "--pool", pool]).await?))
    }

    async fn volume_path(&self, pool: &str, name: &str) -> Result<String> {
        Ok(self.run(&["vol-path", "--pool", pool, name]).await?.trim().to_string())
    }

    async fn create_volume(&self, pool: &str, xml: &str) -> Result<()> {
        self.run_with_xml(&["vol-create", "--pool", pool], xml).await?;
        Ok(())
    }

    async fn upload_volume(&self, pool: &str, name: &str, file: &Path) -> Result<()> {
        self.virsh()
            .args(["vol-upload", "--pool", pool, name])
            .arg(file)
            .timeout(UPLOAD_TIMEOUT)
            .output()
            .await?;
        debug!(pool, volume = name, "Uploaded volume");
        Ok(())
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.run(&["vol-delete", "--pool", pool, name]).await?;
        Ok(())
    }
}
