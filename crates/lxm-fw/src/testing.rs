use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lxm_core::{CommandOutput, CommandRunner};
use std::collections::HashMap;
use tokio::sync::Mutex;

const BUILTINS: &[&str] = &["PREROUTING", "POSTROUTING", "INPUT", "OUTPUT", "FORWARD"];

#[derive(Default)]
struct State {
    /// chain -> rule tails, in order, as passed to -A/-I.
    chains: HashMap<String, Vec<String>>,
    fail_on: Option<String>,
    mutations: usize,
}

/// In-memory iptables stand-in for reconciler tests. Supports the
/// subset of the NAT-table command surface this engine emits and
/// echoes listings the way real iptables does (inserting the `-m`
/// match module after `-p`).
pub struct FakeIptables {
    state: Mutex<State>,
}

impl FakeIptables {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub async fn fail_on(&self, needle: &str) {
        self.state.lock().await.fail_on = Some(needle.to_string());
    }

    pub async fn clear_failure(&self) {
        self.state.lock().await.fail_on = None;
    }

    pub async fn mutation_count(&self) -> usize {
        self.state.lock().await.mutations
    }

    pub async fn rules_in(&self, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .chains
            .get(chain)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn jump_count(&self, chain: &str) -> usize {
        let jump = format!("-j {}", chain);
        self.state
            .lock()
            .await
            .chains
            .get("PREROUTING")
            .map(|rules| rules.iter().filter(|r| r.as_str() == jump).count())
            .unwrap_or(0)
    }

    pub async fn seed_jump(&self, chain: &str, count: usize) {
        let mut state = self.state.lock().await;
        state.chains.entry(chain.to_string()).or_default();
        let prerouting = state.chains.entry("PREROUTING".to_string()).or_default();
        for _ in 0..count {
            prerouting.push(format!("-j {}", chain));
        }
    }

    pub async fn seed_raw_rule(&self, chain: &str, tail: &str) {
        let mut state = self.state.lock().await;
        state
            .chains
            .entry(chain.to_string())
            .or_default()
            .push(tail.to_string());
    }

    fn render_listing(chain: &str, rules: &[String]) -> String {
        let mut out = if BUILTINS.contains(&chain) {
            format!("-P {} ACCEPT\n", chain)
        } else {
            format!("-N {}\n", chain)
        };
        for tail in rules {
            out.push_str(&format!("-A {} {}\n", chain, echo_with_match_module(tail)));
        }
        out
    }
}

/// Real iptables echoes `-p tcp --dport N` back as `-p tcp -m tcp
/// --dport N`; reproduce that so the parser is exercised against the
/// read-back format, not our own canonical one.
fn echo_with_match_module(tail: &str) -> String {
    if tail.contains(" -m ") {
        return tail.to_string();
    }
    for proto in ["tcp", "udp"] {
        let probe = format!("-p {}", proto);
        if tail.contains(&probe) && tail.contains("--dport") {
            return tail.replacen(&probe, &format!("-p {} -m {}", proto, proto), 1);
        }
    }
    tail.to_string()
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        status: 0,
        stdout,
        stderr: String::new(),
    }
}

fn fail(stderr: &str) -> CommandOutput {
    CommandOutput {
        status: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl CommandRunner for FakeIptables {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        if program != "iptables" {
            return Err(anyhow!("unexpected program {}", program));
        }
        if args.len() < 4 || args[0] != "-t" || args[1] != "nat" {
            return Err(anyhow!("unexpected iptables invocation {:?}", args));
        }

        let mut state = self.state.lock().await;
        let full_cmd = args.join(" ");
        if let Some(needle) = &state.fail_on {
            if full_cmd.contains(needle.as_str()) {
                return Ok(fail("simulated failure"));
            }
        }

        let verb = args[2];
        let chain = args[3].to_string();
        let tail = args[4..].join(" ");

        let result = match verb {
            "-N" => {
                if BUILTINS.contains(&chain.as_str()) || state.chains.contains_key(&chain) {
                    fail("iptables: Chain already exists.")
                } else {
                    state.chains.insert(chain, vec![]);
                    state.mutations += 1;
                    ok(String::new())
                }
            }
            "-S" => {
                if BUILTINS.contains(&chain.as_str()) {
                    let rules = state.chains.get(&chain).cloned().unwrap_or_default();
                    ok(FakeIptables::render_listing(&chain, &rules))
                } else {
                    match state.chains.get(&chain) {
                        Some(rules) => ok(FakeIptables::render_listing(&chain, rules)),
                        None => fail("iptables: No chain/target/match by that name."),
                    }
                }
            }
            "-F" => match state.chains.get_mut(&chain) {
                Some(rules) => {
                    rules.clear();
                    state.mutations += 1;
                    ok(String::new())
                }
                None => fail("iptables: No chain/target/match by that name."),
            },
            "-I" => {
                // args: -I CHAIN 1 <tail...>
                let tail = args[5..].join(" ");
                let rules = state.chains.entry(chain).or_default();
                rules.insert(0, tail);
                state.mutations += 1;
                ok(String::new())
            }
            "-A" => match state.chains.get_mut(&chain) {
                Some(rules) => {
                    rules.push(tail);
                    state.mutations += 1;
                    ok(String::new())
                }
                None => fail("iptables: No chain/target/match by that name."),
            },
            "-D" => match state.chains.get_mut(&chain) {
                Some(rules) => match rules.iter().position(|r| *r == tail) {
                    Some(pos) => {
                        rules.remove(pos);
                        state.mutations += 1;
                        ok(String::new())
                    }
                    None => fail("iptables: Bad rule (does a matching rule exist in that chain?)."),
                },
                None => fail("iptables: No chain/target/match by that name."),
            },
            other => Err(anyhow!("unsupported iptables verb {}", other))?,
        };

        Ok(result)
    }
}
