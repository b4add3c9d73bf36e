/*!
Fake host for hardware-free testing

Implements `CommandRunner` over an in-memory model of one DGX Spark node:
docker images and containers, Ray inside the container, the inference
server process, GPUs, RDMA links and ssh reachability of other hosts.
Every command is recorded so tests can assert on what was (not) run.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use spark_agent::execution::{CommandRunner, CommandSpec, ExecutionResult, SSH_CONNECTION_FAILURE};
use std::collections::{BTreeMap, HashSet};

const DEFAULT_RDMA: &str = "rocep1s0f0 port 1 ==> enp1s0f0np0 (Up)\nrocep1s0f1 port 1 ==> enp1s0f1np1 (Up)\n";

#[derive(Debug, Clone, Default)]
struct FakeContainer {
    id: String,
    running: bool,
    ray_version: Option<String>,
    ray_running: bool,
    server_running: bool,
}

#[derive(Debug)]
struct HostState {
    images: HashSet<String>,
    containers: BTreeMap<String, FakeContainer>,
    /// Ray version shipped in the image, before any pip install
    image_ray_version: Option<String>,
    /// Active nodes `ray status` reports once Ray runs in a container
    ray_nodes: usize,
    server_crashes: bool,
    server_log: String,
    gpus: Vec<String>,
    rdma: Option<String>,
    /// IPv4 per netdev; links without an entry carry no address
    addresses: BTreeMap<String, String>,
    missing_tools: HashSet<String>,
    unreachable_hosts: HashSet<String>,
    failures: Vec<String>,
    next_id: u64,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            images: HashSet::new(),
            containers: BTreeMap::new(),
            image_ray_version: None,
            ray_nodes: 2,
            server_crashes: false,
            server_log: "INFO:     Application startup complete.\n".to_string(),
            gpus: vec!["NVIDIA GB10".to_string()],
            rdma: Some(DEFAULT_RDMA.to_string()),
            addresses: BTreeMap::new(),
            missing_tools: HashSet::new(),
            unreachable_hosts: HashSet::new(),
            failures: Vec::new(),
            next_id: 1,
        }
    }
}

/// In-memory node answering docker, nvidia-smi, ibdev2netdev, which and ssh
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
    history: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image already present locally
    pub fn with_image(self, image: &str) -> Self {
        self.state.lock().images.insert(image.to_string());
        self
    }

    pub fn with_image_ray_version(self, version: &str) -> Self {
        self.state.lock().image_ray_version = Some(version.to_string());
        self
    }

    pub fn with_ray_nodes(self, nodes: usize) -> Self {
        self.state.lock().ray_nodes = nodes;
        self
    }

    pub fn with_gpus(self, names: &[&str]) -> Self {
        self.state.lock().gpus = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// ibdev2netdev output; None makes the tool fail
    pub fn with_rdma(self, output: Option<&str>) -> Self {
        self.state.lock().rdma = output.map(String::from);
        self
    }

    pub fn with_address(self, netdev: &str, address: &str) -> Self {
        self.state.lock().addresses.insert(netdev.to_string(), address.to_string());
        self
    }

    pub fn with_server_log(self, log: &str) -> Self {
        self.state.lock().server_log = log.to_string();
        self
    }

    /// `vllm serve` exits immediately after launch
    pub fn server_crashes(self) -> Self {
        self.state.lock().server_crashes = true;
        self
    }

    pub fn without_tool(self, tool: &str) -> Self {
        self.state.lock().missing_tools.insert(tool.to_string());
        self
    }

    /// ssh to this host fails at connection level
    pub fn unreachable(self, host: &str) -> Self {
        self.state.lock().unreachable_hosts.insert(host.to_string());
        self
    }

    /// Any command whose rendering contains `needle` exits 1
    pub fn fail_when(self, needle: &str) -> Self {
        self.state.lock().failures.push(needle.to_string());
        self
    }

    /// Change the reported Ray node count mid-test (e.g. a worker leaving)
    pub fn set_ray_nodes(&self, nodes: usize) {
        self.state.lock().ray_nodes = nodes;
    }

    /// Rendered commands in execution order
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.history.lock().iter().any(|c| c.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.history.lock().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    pub fn container_running(&self, name: &str) -> bool {
        self.state.lock().containers.get(name).is_some_and(|c| c.running)
    }

    pub fn ray_version_in(&self, name: &str) -> Option<String> {
        self.state.lock().containers.get(name).and_then(|c| c.ray_version.clone())
    }

    pub fn server_running_in(&self, name: &str) -> bool {
        self.state.lock().containers.get(name).is_some_and(|c| c.server_running)
    }

    fn dispatch(&self, program: &str, args: &[String]) -> Reply {
        match program {
            "true" => Reply::ok(""),
            "which" => self.which(args),
            "nvidia-smi" => self.nvidia_smi(args),
            "ibdev2netdev" => self.ibdev2netdev(),
            "ssh" => self.ssh(args),
            "docker" => self.docker(args),
            "bash" => self.host_shell(args),
            other => Reply::not_found(other),
        }
    }

    fn which(&self, args: &[String]) -> Reply {
        let Some(tool) = args.first() else {
            return Reply::exit(1, "", "");
        };
        if self.state.lock().missing_tools.contains(tool) {
            Reply::exit(1, "", "")
        } else {
            Reply::ok(&format!("/usr/bin/{}\n", tool))
        }
    }

    fn nvidia_smi(&self, args: &[String]) -> Reply {
        let state = self.state.lock();
        if state.missing_tools.contains("nvidia-smi") {
            return Reply::not_found("nvidia-smi");
        }
        if args.first().map(String::as_str) == Some("-L") {
            let list: String = state
                .gpus
                .iter()
                .enumerate()
                .map(|(i, name)| format!("GPU {}: {} (UUID: GPU-0000000{})\n", i, name, i))
                .collect();
            return Reply::ok(&list);
        }
        let query: String = state
            .gpus
            .iter()
            .enumerate()
            .map(|(i, name)| format!("{}, {}, 41, 3, 1024, 122880, [N/A]\n", i, name))
            .collect();
        Reply::ok(&query)
    }

    fn ibdev2netdev(&self) -> Reply {
        let state = self.state.lock();
        if state.missing_tools.contains("ibdev2netdev") {
            return Reply::not_found("ibdev2netdev");
        }
        match &state.rdma {
            Some(output) => Reply::ok(output),
            None => Reply::not_found("ibdev2netdev"),
        }
    }

    /// Labelled address and link speed for one interface
    fn host_shell(&self, args: &[String]) -> Reply {
        let Some(script) = args.get(1) else {
            return Reply::ok("");
        };
        let Some(netdev) = script
            .split("/sys/class/net/")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
        else {
            return Reply::ok("");
        };
        let address = self.state.lock().addresses.get(netdev).cloned().unwrap_or_default();
        Reply::ok(&format!("addr={}\nspeed=200000\n", address))
    }

    fn ssh(&self, args: &[String]) -> Reply {
        // ssh [-o opt]... destination command
        let (Some(remote), Some(destination)) = (args.last(), args.iter().rev().nth(1)) else {
            return Reply::exit(SSH_CONNECTION_FAILURE, "", "usage: ssh destination command");
        };
        let host = destination.rsplit('@').next().unwrap_or(destination);
        if self.state.lock().unreachable_hosts.contains(host) {
            return Reply::exit(
                SSH_CONNECTION_FAILURE,
                "",
                &format!("ssh: connect to host {} port 22: Connection timed out", host),
            );
        }

        // Other hosts answer like this one
        let words = match shell_words::split(remote) {
            Ok(words) => words,
            Err(e) => return Reply::exit(2, "", &format!("bash: {}", e)),
        };
        let words: Vec<String> = words.into_iter().skip_while(|w| w.contains('=') && !w.starts_with('-')).collect();
        match words.split_first() {
            Some((program, rest)) => self.dispatch(program, rest),
            None => Reply::ok(""),
        }
    }

    fn docker(&self, args: &[String]) -> Reply {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut state = self.state.lock();

        match args.as_slice() {
            ["pull", image] => {
                state.images.insert(image.to_string());
                Reply::ok(&format!("Status: Downloaded newer image for {}\n", image))
            }
            ["image", "inspect", image] => {
                if state.images.contains(*image) {
                    Reply::ok("[{}]\n")
                } else {
                    Reply::exit(1, "[]\n", &format!("Error: No such image: {}", image))
                }
            }
            ["inspect", "--format", _, name] => match state.containers.get(*name) {
                Some(c) if c.running => Reply::ok("running\n"),
                Some(_) => Reply::ok("exited\n"),
                None => Reply::exit(1, "", &format!("Error: No such object: {}", name)),
            },
            ["ps", "-a", "--filter", filter, "--format", _] => {
                let wanted = filter
                    .trim_start_matches("name=^/")
                    .trim_end_matches('$');
                let names: String = state
                    .containers
                    .keys()
                    .filter(|name| name.as_str() == wanted)
                    .map(|name| format!("{}\n", name))
                    .collect();
                Reply::ok(&names)
            }
            ["rm", "-f", name] => match state.containers.remove(*name) {
                Some(_) => Reply::ok(&format!("{}\n", name)),
                None => Reply::exit(1, "", &format!("Error response from daemon: No such container: {}", name)),
            },
            ["run", rest @ ..] => {
                let Some(name) = rest.iter().position(|a| *a == "--name").and_then(|i| rest.get(i + 1)) else {
                    return Reply::exit(125, "", "docker: --name required by fake host");
                };
                if state.containers.contains_key(*name) {
                    return Reply::exit(
                        125,
                        "",
                        &format!("docker: Error response from daemon: Conflict. The container name \"/{}\" is already in use.", name),
                    );
                }
                let id = format!("{:064x}", state.next_id);
                state.next_id += 1;
                let ray_version = state.image_ray_version.clone();
                state.containers.insert(
                    name.to_string(),
                    FakeContainer {
                        id: id.clone(),
                        running: true,
                        ray_version,
                        ..Default::default()
                    },
                );
                Reply::ok(&format!("{}\n", id))
            }
            ["exec", rest @ ..] => {
                let mut rest = rest;
                let detached = rest.first() == Some(&"-d");
                if detached {
                    rest = &rest[1..];
                }
                while let ["-e", _, tail @ ..] = rest {
                    rest = tail;
                }
                let [name, "bash", "-lc", script] = rest else {
                    return Reply::exit(125, "", "docker exec: unsupported invocation");
                };
                state.exec(name, script, detached)
            }
            ["logs", "--tail", _, name] => match state.containers.get(*name) {
                Some(c) => Reply::ok(&format!("container {} started\n", &c.id[..12])),
                None => Reply::exit(1, "", &format!("Error: No such container: {}", name)),
            },
            _ => Reply::exit(125, "", &format!("docker: unsupported command {:?}", args)),
        }
    }
}

impl HostState {
    fn exec(&mut self, name: &str, script: &str, detached: bool) -> Reply {
        let ray_nodes = self.ray_nodes;
        let server_crashes = self.server_crashes;
        let server_log = self.server_log.clone();
        let Some(container) = self.containers.get_mut(name) else {
            return Reply::exit(1, "", &format!("Error response from daemon: No such container: {}", name));
        };
        if !container.running {
            return Reply::exit(1, "", &format!("Error response from daemon: container {} is not running", name));
        }

        if script.starts_with("ray --version") {
            return match &container.ray_version {
                Some(v) => Reply::ok(&format!("ray, version {}\n", v)),
                None => Reply::not_found("ray"),
            };
        }
        if script.starts_with("pip install") {
            let version = script
                .split("==")
                .nth(1)
                .map(|v| v.trim_end_matches('\'').to_string());
            container.ray_version = version;
            return Reply::ok("Successfully installed ray\n");
        }
        if script.starts_with("ray stop") {
            container.ray_running = false;
            return Reply::ok("Stopped all Ray processes.\n");
        }
        if script.starts_with("ray start") {
            if container.ray_version.is_none() {
                return Reply::not_found("ray");
            }
            container.ray_running = true;
            return Reply::ok("Ray runtime started.\n");
        }
        if script.starts_with("ray status") {
            if !container.ray_running {
                return Reply::exit(1, "", "ConnectionError: Could not find any running Ray instance.");
            }
            return Reply::ok(&ray_status_output(ray_nodes));
        }
        if script.starts_with("pgrep -f") {
            return if container.server_running {
                Reply::ok("4242\n")
            } else {
                Reply::exit(1, "", "")
            };
        }
        if script.starts_with("pkill -f") {
            let was_running = std::mem::take(&mut container.server_running);
            return if was_running {
                Reply::ok("")
            } else {
                Reply::exit(1, "", "")
            };
        }
        if script.starts_with("huggingface-cli download") {
            return Reply::ok("/root/.cache/huggingface/hub/models--fake/snapshots/0\n");
        }
        if script.contains("vllm serve") && detached {
            container.server_running = !server_crashes;
            return Reply::ok("");
        }
        if script.starts_with("tail -n") {
            return Reply::ok(&server_log);
        }
        Reply::ok("")
    }
}

fn ray_status_output(nodes: usize) -> String {
    let mut out = String::from(
        "======== Autoscaler status: 2025-10-14 13:13:59.104771 ========\nNode status\n---------------------------------------------------------------\nActive:\n",
    );
    for i in 0..nodes {
        out.push_str(&format!(" 1 node_{:056x}\n", i + 1));
    }
    out.push_str("Pending:\n (no pending nodes)\nRecent failures:\n (no failures)\n\nResources\n---------------------------------------------------------------\n");
    out
}

struct Reply {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl Reply {
    fn ok(stdout: &str) -> Self {
        Self::exit(0, stdout, "")
    }

    fn exit(exit_code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    fn not_found(program: &str) -> Self {
        Self::exit(127, "", &format!("bash: {}: command not found", program))
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, spec: &CommandSpec) -> ExecutionResult {
        let rendered = spec.display();
        self.history.lock().push(rendered.clone());

        let injected = self.state.lock().failures.iter().any(|needle| rendered.contains(needle));
        if injected {
            log::debug!("[FAKE] injected failure: {}", rendered);
            return ExecutionResult::completed(&rendered, 1, "", "injected failure");
        }

        let reply = self.dispatch(&spec.program, &spec.args);
        log::debug!("[FAKE] {} -> {}", rendered, reply.exit_code);
        ExecutionResult::completed(&rendered, reply.exit_code, reply.stdout, reply.stderr)
    }
}
