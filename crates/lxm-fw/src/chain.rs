use anyhow::{Context, Result, anyhow};
use lxm_core::{
    BindInterface, CommandOutput, CommandRunner, EngineError, EngineResult, Protocol, RuleSpec,
};
use std::str::FromStr;
use std::sync::Arc;

/// Kernel built-in NAT chains this engine must never own or mutate
/// beyond the single jump rule in PREROUTING.
const BUILTIN_CHAINS: &[&str] = &["PREROUTING", "POSTROUTING", "INPUT", "OUTPUT", "FORWARD"];

const PREROUTING: &str = "PREROUTING";

/// Live contents of the managed chain. `foreign_lines` counts lines
/// this engine cannot attribute to itself (manual tampering inside the
/// chain); they are only ever cleared by a full resync flush.
#[derive(Debug, Clone)]
pub struct ChainState {
    pub rules: Vec<RuleSpec>,
    pub foreign_lines: usize,
}

/// Owns one dedicated iptables NAT chain. Every read and write this
/// engine performs against the kernel firewall goes through here and
/// names only the managed chain, plus the single jump rule that wires
/// it into PREROUTING.
pub struct ChainManager {
    chain: String,
    runner: Arc<dyn CommandRunner>,
}

impl ChainManager {
    /// Fails closed: refuses to manage a kernel built-in chain.
    pub fn new(chain: &str, runner: Arc<dyn CommandRunner>) -> EngineResult<Self> {
        let chain = chain.trim().to_string();
        if chain.is_empty() {
            return Err(EngineError::Validation("chain name is empty".into()));
        }
        if BUILTIN_CHAINS
            .iter()
            .any(|b| b.eq_ignore_ascii_case(&chain))
        {
            return Err(EngineError::Validation(format!(
                "refusing to manage built-in chain {}",
                chain
            )));
        }
        Ok(Self { chain, runner })
    }

    pub fn chain_name(&self) -> &str {
        &self.chain
    }

    async fn iptables(&self, args: &[&str]) -> Result<CommandOutput> {
        self.runner.run("iptables", args).await
    }

    /// Create the managed chain if absent and guarantee exactly one
    /// jump rule from PREROUTING into it. Idempotent; excess jump
    /// rules left behind by a crashed run are deduplicated.
    pub async fn ensure_chain(&self) -> Result<()> {
        let create = self.iptables(&["-t", "nat", "-N", self.chain.as_str()]).await?;
        if !create.success() && !create.stderr.contains("already exists") {
            return Err(anyhow!(
                "failed to create chain {}: {}",
                self.chain,
                create.error_text()
            ));
        }

        let listing = self.iptables(&["-t", "nat", "-S", PREROUTING]).await?;
        if !listing.success() {
            return Err(anyhow!(
                "failed to list {}: {}",
                PREROUTING,
                listing.error_text()
            ));
        }

        let jump_line = format!("-A {} -j {}", PREROUTING, self.chain);
        let jumps = listing
            .stdout
            .lines()
            .filter(|l| l.trim() == jump_line)
            .count();

        match jumps {
            0 => {
                tracing::info!(chain = %self.chain, "installing jump rule");
                let out = self
                    .iptables(&["-t", "nat", "-I", PREROUTING, "1", "-j", self.chain.as_str()])
                    .await?;
                if !out.success() {
                    return Err(anyhow!("failed to insert jump rule: {}", out.error_text()));
                }
            }
            1 => {}
            extra => {
                // Exactly one jump rule must remain.
                tracing::warn!(chain = %self.chain, count = extra, "removing duplicate jump rules");
                for _ in 1..extra {
                    let out = self
                        .iptables(&["-t", "nat", "-D", PREROUTING, "-j", self.chain.as_str()])
                        .await?;
                    if !out.success() {
                        return Err(anyhow!(
                            "failed to remove duplicate jump rule: {}",
                            out.error_text()
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Read back the managed chain. Rules elsewhere are never touched
    /// or reported.
    pub async fn read_chain(&self) -> Result<ChainState> {
        let listing = self.iptables(&["-t", "nat", "-S", self.chain.as_str()]).await?;
        if !listing.success() {
            return Err(anyhow!(
                "failed to list chain {}: {}",
                self.chain,
                listing.error_text()
            ));
        }

        let prefix = format!("-A {} ", self.chain);
        let mut rules = vec![];
        let mut foreign = 0;

        for line in listing.stdout.lines() {
            let line = line.trim();
            let Some(rest) = line.strip_prefix(&prefix) else {
                continue; // "-N <chain>" header
            };
            match parse_rule_tokens(rest) {
                Ok(spec) => rules.push(spec),
                Err(e) => {
                    foreign += 1;
                    tracing::warn!(chain = %self.chain, line, error = %e, "unrecognized rule in managed chain");
                }
            }
        }

        Ok(ChainState {
            rules,
            foreign_lines: foreign,
        })
    }

    pub async fn list_managed_rules(&self) -> Result<Vec<RuleSpec>> {
        Ok(self.read_chain().await?.rules)
    }

    /// Remove every rule inside the managed chain. The jump rule lives
    /// in PREROUTING and is unaffected.
    pub async fn flush_managed_chain(&self) -> Result<()> {
        let out = self.iptables(&["-t", "nat", "-F", self.chain.as_str()]).await?;
        if !out.success() {
            return Err(anyhow!(
                "failed to flush chain {}: {}",
                self.chain,
                out.error_text()
            ));
        }
        Ok(())
    }

    pub async fn append_rule(&self, spec: &RuleSpec) -> EngineResult<()> {
        self.mutate_rule("-A", spec).await
    }

    pub async fn delete_rule(&self, spec: &RuleSpec) -> EngineResult<()> {
        self.mutate_rule("-D", spec).await
    }

    async fn mutate_rule(&self, action: &str, spec: &RuleSpec) -> EngineResult<()> {
        let dport = spec.external_port.to_string();
        let dest = format!("{}:{}", spec.target_address, spec.target_port);

        let mut args: Vec<&str> = vec!["-t", "nat", action, self.chain.as_str()];
        if let BindInterface::Iface(ref iface) = spec.bind_interface {
            args.push("-i");
            args.push(iface.as_str());
        }
        args.extend_from_slice(&[
            "-p",
            spec.protocol.as_str(),
            "--dport",
            dport.as_str(),
            "-j",
            "DNAT",
            "--to-destination",
            dest.as_str(),
        ]);

        let out = self.iptables(&args).await?;
        if !out.success() {
            return Err(EngineError::Apply(format!(
                "iptables {} {} failed: {}",
                action,
                spec,
                out.error_text()
            )));
        }
        Ok(())
    }
}

/// Parse the argument tail of an `iptables -S` line this engine wrote:
/// `-p tcp [-m tcp] [-i eth0] --dport 8080 -j DNAT --to-destination
/// 10.0.3.5:80`. Anything else is foreign.
fn parse_rule_tokens(rest: &str) -> Result<RuleSpec> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();

    let mut protocol = None;
    let mut iface = None;
    let mut dport = None;
    let mut dest = None;
    let mut jump = None;

    let mut i = 0;
    while i < tokens.len() {
        let flag = tokens[i];
        let value = tokens
            .get(i + 1)
            .ok_or_else(|| anyhow!("flag {} has no value", flag))?;
        match flag {
            "-p" => protocol = Some(Protocol::from_str(value)?),
            "-m" => {} // match module echoed back by iptables
            "-i" => iface = Some(value.to_string()),
            "--dport" => dport = Some(value.parse::<u16>().context("bad dport")?),
            "-j" => jump = Some(value.to_string()),
            "--to-destination" => dest = Some(value.to_string()),
            other => return Err(anyhow!("unexpected token '{}'", other)),
        }
        i += 2;
    }

    if jump.as_deref() != Some("DNAT") {
        return Err(anyhow!("not a DNAT rule"));
    }
    let protocol = protocol.ok_or_else(|| anyhow!("missing protocol"))?;
    let external_port = dport.ok_or_else(|| anyhow!("missing dport"))?;
    let dest = dest.ok_or_else(|| anyhow!("missing destination"))?;
    let (addr, port) = dest
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("destination must be IP:PORT"))?;

    Ok(RuleSpec {
        protocol,
        external_port,
        bind_interface: iface
            .map(BindInterface::Iface)
            .unwrap_or(BindInterface::All),
        target_address: addr.parse().context("bad destination address")?,
        target_port: port.parse().context("bad destination port")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeIptables;

    fn spec(port: u16, iface: BindInterface) -> RuleSpec {
        RuleSpec {
            protocol: Protocol::Tcp,
            external_port: port,
            bind_interface: iface,
            target_address: "10.0.3.5".parse().unwrap(),
            target_port: 80,
        }
    }

    #[test]
    fn refuses_builtin_chains() {
        let runner = Arc::new(FakeIptables::new());
        assert!(ChainManager::new("PREROUTING", runner.clone()).is_err());
        assert!(ChainManager::new("prerouting", runner.clone()).is_err());
        assert!(ChainManager::new("", runner.clone()).is_err());
        assert!(ChainManager::new("LXM_MANAGER", runner).is_ok());
    }

    #[tokio::test]
    async fn ensure_chain_is_idempotent() {
        let runner = Arc::new(FakeIptables::new());
        let mgr = ChainManager::new("LXM_MANAGER", runner.clone()).unwrap();

        mgr.ensure_chain().await.unwrap();
        mgr.ensure_chain().await.unwrap();
        mgr.ensure_chain().await.unwrap();

        assert_eq!(runner.jump_count("LXM_MANAGER").await, 1);
    }

    #[tokio::test]
    async fn ensure_chain_removes_duplicate_jumps() {
        let runner = Arc::new(FakeIptables::new());
        runner.seed_jump("LXM_MANAGER", 3).await;

        let mgr = ChainManager::new("LXM_MANAGER", runner.clone()).unwrap();
        mgr.ensure_chain().await.unwrap();

        assert_eq!(runner.jump_count("LXM_MANAGER").await, 1);
    }

    #[tokio::test]
    async fn append_list_delete_round_trip() {
        let runner = Arc::new(FakeIptables::new());
        let mgr = ChainManager::new("LXM_MANAGER", runner).unwrap();
        mgr.ensure_chain().await.unwrap();

        let all = spec(8080, BindInterface::All);
        let bound = spec(2222, BindInterface::Iface("enp6s0f1".into()));
        mgr.append_rule(&all).await.unwrap();
        mgr.append_rule(&bound).await.unwrap();

        let live = mgr.list_managed_rules().await.unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.contains(&all));
        assert!(live.contains(&bound));

        mgr.delete_rule(&all).await.unwrap();
        let live = mgr.list_managed_rules().await.unwrap();
        assert_eq!(live, vec![bound]);
    }

    #[tokio::test]
    async fn flush_clears_rules_but_not_jump() {
        let runner = Arc::new(FakeIptables::new());
        let mgr = ChainManager::new("LXM_MANAGER", runner.clone()).unwrap();
        mgr.ensure_chain().await.unwrap();
        mgr.append_rule(&spec(8080, BindInterface::All)).await.unwrap();

        mgr.flush_managed_chain().await.unwrap();

        assert!(mgr.list_managed_rules().await.unwrap().is_empty());
        assert_eq!(runner.jump_count("LXM_MANAGER").await, 1);
    }

    #[tokio::test]
    async fn foreign_lines_are_counted_not_parsed() {
        let runner = Arc::new(FakeIptables::new());
        let mgr = ChainManager::new("LXM_MANAGER", runner.clone()).unwrap();
        mgr.ensure_chain().await.unwrap();
        mgr.append_rule(&spec(8080, BindInterface::All)).await.unwrap();
        runner
            .seed_raw_rule("LXM_MANAGER", "-s 192.168.0.0/24 -j MASQUERADE")
            .await;

        let state = mgr.read_chain().await.unwrap();
        assert_eq!(state.rules.len(), 1);
        assert_eq!(state.foreign_lines, 1);
    }

    #[test]
    fn parses_iptables_echo_format() {
        let spec = parse_rule_tokens(
            "-i eth0 -p tcp -m tcp --dport 8080 -j DNAT --to-destination 10.0.3.5:80",
        )
        .unwrap();
        assert_eq!(spec.external_port, 8080);
        assert_eq!(spec.bind_interface, BindInterface::Iface("eth0".into()));
        assert_eq!(spec.target_port, 80);
    }

    #[test]
    fn rejects_non_dnat_lines() {
        assert!(parse_rule_tokens("-p tcp -j ACCEPT").is_err());
        assert!(parse_rule_tokens("-s 10.0.0.0/8 -j MASQUERADE").is_err());
    }
}
