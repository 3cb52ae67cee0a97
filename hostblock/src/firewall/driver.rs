//! Thin shell over the external rule-management tool.
//!
//! Invocations are argv lists, never shell strings, so capture groups
//! from matched log lines can never smuggle shell metacharacters into a
//! command.

use async_trait::async_trait;
use hostblock_shared::errors::{HostblockError, HostblockResult};
use tokio::process::Command;
use tracing::debug;

/// Protocol family a rule applies to; selects the tool binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Family of a textual address.
    pub fn of(address: &str) -> Self {
        if address.contains(':') {
            IpFamily::V6
        } else {
            IpFamily::V4
        }
    }

    pub fn tool(&self) -> &'static str {
        match self {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }
}

/// Operations the reconciler needs from the packet filter.
#[async_trait]
pub trait FirewallDriver: Send + Sync {
    async fn new_chain(&self, chain: &str, family: IpFamily) -> HostblockResult<()>;

    /// Append a rule to the end of the chain.
    async fn append(&self, chain: &str, rule: &str, family: IpFamily) -> HostblockResult<()>;

    /// Insert a rule at the given 1-based position.
    async fn insert(
        &self,
        chain: &str,
        position: u32,
        rule: &str,
        family: IpFamily,
    ) -> HostblockResult<()>;

    async fn remove(&self, chain: &str, rule: &str, family: IpFamily) -> HostblockResult<()>;

    /// Rules of the chain, in order, one specification string per rule.
    async fn list_rules(&self, chain: &str, family: IpFamily) -> HostblockResult<Vec<String>>;

    /// Free-form invocation of the tool, returning its stdout.
    async fn command(&self, args: &[String], family: IpFamily) -> HostblockResult<String>;
}

/// Driver invoking iptables/ip6tables.
pub struct IptablesDriver;

impl IptablesDriver {
    /// Managing the packet filter requires privileged execution; refuse
    /// to construct a driver otherwise.
    pub fn new() -> HostblockResult<Self> {
        if unsafe { libc::geteuid() } != 0 {
            return Err(HostblockError::Io(
                "root access required to manage the packet filter".to_string(),
            ));
        }
        Ok(IptablesDriver)
    }

    async fn run(&self, family: IpFamily, args: Vec<String>) -> HostblockResult<String> {
        debug!("{} {}", family.tool(), args.join(" "));
        let output = Command::new(family.tool())
            .args(&args)
            .output()
            .await
            .map_err(|e| HostblockError::Io(format!("failed to run {}: {e}", family.tool())))?;
        if !output.status.success() {
            return Err(HostblockError::Subprocess {
                tool: family.tool().to_string(),
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Split a rule specification into argv elements.
fn rule_args(rule: &str) -> impl Iterator<Item = String> + '_ {
    rule.split_whitespace().map(str::to_string)
}

#[async_trait]
impl FirewallDriver for IptablesDriver {
    async fn new_chain(&self, chain: &str, family: IpFamily) -> HostblockResult<()> {
        self.run(family, vec!["-N".to_string(), chain.to_string()])
            .await
            .map(drop)
    }

    async fn append(&self, chain: &str, rule: &str, family: IpFamily) -> HostblockResult<()> {
        let mut args = vec!["-A".to_string(), chain.to_string()];
        args.extend(rule_args(rule));
        self.run(family, args).await.map(drop)
    }

    async fn insert(
        &self,
        chain: &str,
        position: u32,
        rule: &str,
        family: IpFamily,
    ) -> HostblockResult<()> {
        let mut args = vec!["-I".to_string(), chain.to_string(), position.to_string()];
        args.extend(rule_args(rule));
        self.run(family, args).await.map(drop)
    }

    async fn remove(&self, chain: &str, rule: &str, family: IpFamily) -> HostblockResult<()> {
        let mut args = vec!["-D".to_string(), chain.to_string()];
        args.extend(rule_args(rule));
        self.run(family, args).await.map(drop)
    }

    async fn list_rules(&self, chain: &str, family: IpFamily) -> HostblockResult<Vec<String>> {
        let stdout = self
            .run(family, vec!["--list-rules".to_string(), chain.to_string()])
            .await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }

    async fn command(&self, args: &[String], family: IpFamily) -> HostblockResult<String> {
        self.run(family, args.to_vec()).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_of_address() {
        assert_eq!(IpFamily::of("203.0.113.7"), IpFamily::V4);
        assert_eq!(IpFamily::of("2001:db8::42"), IpFamily::V6);
    }

    #[test]
    fn test_rule_args_split() {
        let args: Vec<String> = rule_args("-s 1.2.3.4 -j DROP").collect();
        assert_eq!(args, vec!["-s", "1.2.3.4", "-j", "DROP"]);
    }
}
