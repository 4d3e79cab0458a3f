use thiserror::Error;

use tela_bytecode::Opcode;

#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum PolicyError {
    #[error("unknown opcode name `{0}` in policy spec")]
    UnknownOpcode(String),
    #[error("unknown advice mode `{0}` in policy spec (expected B, A or AB)")]
    UnknownMode(String),
    #[error("`{0}` is not a standard advice configuration")]
    UnknownConfig(String),
}

/// Which advice hooks the policy wants for one opcode.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct AdviceModes {
    pub before: bool,
    pub after: bool,
}

impl AdviceModes {
    pub const NONE: AdviceModes = AdviceModes {
        before: false,
        after: false,
    };
    pub const BEFORE: AdviceModes = AdviceModes {
        before: true,
        after: false,
    };
    pub const AFTER: AdviceModes = AdviceModes {
        before: false,
        after: true,
    };
    pub const BOTH: AdviceModes = AdviceModes {
        before: true,
        after: true,
    };

    pub fn any(self) -> bool {
        self.before || self.after
    }

    pub fn union(self, other: AdviceModes) -> AdviceModes {
        AdviceModes {
            before: self.before || other.before,
            after: self.after || other.after,
        }
    }

    pub fn intersect(self, other: AdviceModes) -> AdviceModes {
        AdviceModes {
            before: self.before && other.before,
            after: self.after && other.after,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ModeOption {
    B,
    A,
    BA,
}

impl ModeOption {
    fn to_modes(self) -> AdviceModes {
        match self {
            ModeOption::B => AdviceModes::BEFORE,
            ModeOption::A => AdviceModes::AFTER,
            ModeOption::BA => AdviceModes::BOTH,
        }
    }

    fn parse(text: &str) -> Result<ModeOption, PolicyError> {
        match text {
            "B" => Ok(ModeOption::B),
            "A" => Ok(ModeOption::A),
            "AB" | "BA" => Ok(ModeOption::BA),
            _ => Err(PolicyError::UnknownMode(text.to_string())),
        }
    }
}

type Bm = (Opcode, ModeOption);

fn object_creation() -> Vec<Bm> {
    vec![
        (Opcode::New, ModeOption::A),
        (Opcode::NewArray, ModeOption::A),
    ]
}

fn field_reads() -> Vec<Bm> {
    vec![
        (Opcode::GetField, ModeOption::B),
        (Opcode::GetStatic, ModeOption::B),
    ]
}

fn field_writes() -> Vec<Bm> {
    vec![
        (Opcode::PutField, ModeOption::B),
        (Opcode::PutStatic, ModeOption::B),
    ]
}

fn invokes() -> Vec<Bm> {
    vec![
        (Opcode::InvokeVirtual, ModeOption::B),
        (Opcode::InvokeInterface, ModeOption::B),
        (Opcode::InvokeSpecial, ModeOption::B),
        (Opcode::InvokeStatic, ModeOption::B),
    ]
}

fn monitors() -> Vec<Bm> {
    vec![
        (Opcode::MonitorEnter, ModeOption::B),
        (Opcode::MonitorExit, ModeOption::B),
    ]
}

fn casts() -> Vec<Bm> {
    vec![
        (Opcode::CheckCast, ModeOption::B),
        (Opcode::InstanceOf, ModeOption::B),
    ]
}

fn ref_branches() -> Vec<Bm> {
    vec![
        (Opcode::IfRefCmp, ModeOption::B),
        (Opcode::IfNull, ModeOption::B),
    ]
}

/// Any access to an object's state: field and array element reads plus
/// the bytecodes that touch class metadata (invokes, casts, monitors,
/// throw).
fn object_reads() -> Vec<Bm> {
    compose(vec![
        field_reads(),
        vec![
            (Opcode::ArrayLoad, ModeOption::B),
            (Opcode::ArrayLength, ModeOption::B),
        ],
        invokes(),
        monitors(),
        casts(),
        vec![(Opcode::Throw, ModeOption::B)],
    ])
}

fn object_writes() -> Vec<Bm> {
    compose(vec![
        field_writes(),
        vec![(Opcode::ArrayStore, ModeOption::B)],
    ])
}

fn method_entry() -> Vec<Bm> {
    vec![(Opcode::MethodEntry, ModeOption::A)]
}

fn method_exit() -> Vec<Bm> {
    vec![(Opcode::Return, ModeOption::B)]
}

/// Uses of an object that do not read its state.
fn object_uses() -> Vec<Bm> {
    compose(vec![
        ref_branches(),
        vec![
            (Opcode::Store, ModeOption::B),
            (Opcode::Load, ModeOption::A),
        ],
    ])
}

fn compose(groups: Vec<Vec<Bm>>) -> Vec<Bm> {
    groups.into_iter().flatten().collect()
}

/// Canned policy configurations selecting the bytecodes relevant to a
/// particular analysis.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StdConfig {
    Null,
    Read,
    Write,
    Monitor,
    BeforeInvoke,
    Invoke,
    Entry,
    Exit,
    EntryExit,
    ObjectAccess,
    ObjectUse,
}

impl StdConfig {
    pub const ALL: [StdConfig; 11] = [
        StdConfig::Null,
        StdConfig::Read,
        StdConfig::Write,
        StdConfig::Monitor,
        StdConfig::BeforeInvoke,
        StdConfig::Invoke,
        StdConfig::Entry,
        StdConfig::Exit,
        StdConfig::EntryExit,
        StdConfig::ObjectAccess,
        StdConfig::ObjectUse,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StdConfig::Null => "null",
            StdConfig::Read => "read",
            StdConfig::Write => "write",
            StdConfig::Monitor => "monitor",
            StdConfig::BeforeInvoke => "beforeinvoke",
            StdConfig::Invoke => "invoke",
            StdConfig::Entry => "entry",
            StdConfig::Exit => "exit",
            StdConfig::EntryExit => "entryexit",
            StdConfig::ObjectAccess => "objectaccess",
            StdConfig::ObjectUse => "objectuse",
        }
    }

    pub fn from_name(name: &str) -> Option<StdConfig> {
        StdConfig::ALL.iter().copied().find(|c| c.name() == name)
    }

    fn entries(self) -> Vec<Bm> {
        match self {
            StdConfig::Null => Vec::new(),
            StdConfig::Read => compose(vec![object_creation(), object_reads()]),
            StdConfig::Write => compose(vec![object_creation(), object_writes()]),
            StdConfig::Monitor => monitors(),
            StdConfig::BeforeInvoke | StdConfig::Invoke => invokes(),
            StdConfig::Entry => method_entry(),
            StdConfig::Exit => method_exit(),
            StdConfig::EntryExit => compose(vec![method_entry(), method_exit()]),
            StdConfig::ObjectAccess => compose(vec![
                object_creation(),
                method_entry(),
                method_exit(),
                object_reads(),
                object_writes(),
            ]),
            StdConfig::ObjectUse => compose(vec![
                StdConfig::ObjectAccess.entries(),
                object_uses(),
            ]),
        }
    }
}

/// The per-opcode advice policy: two booleans per opcode, read by the
/// variant selector once per instruction occurrence. The table is
/// complete over `Opcode` by construction, so selection itself can
/// never fail; all configuration faults surface while the table is
/// loaded.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AdvicePolicy {
    modes: [AdviceModes; Opcode::COUNT],
}

impl AdvicePolicy {
    pub fn none() -> AdvicePolicy {
        AdvicePolicy {
            modes: [AdviceModes::NONE; Opcode::COUNT],
        }
    }

    pub fn all() -> AdvicePolicy {
        AdvicePolicy {
            modes: [AdviceModes::BOTH; Opcode::COUNT],
        }
    }

    /// Builds a policy from a comma-separated list of standard
    /// configuration names, e.g. `"read,monitor"`.
    pub fn from_std_configs(names: &str) -> Result<AdvicePolicy, PolicyError> {
        let mut policy = AdvicePolicy::none();

        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let config = StdConfig::from_name(name)
                .ok_or_else(|| PolicyError::UnknownConfig(name.to_string()))?;
            policy.apply_config(config);
        }

        Ok(policy)
    }

    pub fn apply_config(&mut self, config: StdConfig) {
        for (opcode, mode) in config.entries() {
            let slot = &mut self.modes[opcode.to_usize()];
            *slot = slot.union(mode.to_modes());
        }
    }

    /// Applies a per-opcode spec string such as
    /// `"GetField:B,PutField:AB,Return"` (a missing mode suffix means
    /// both hooks). With `enable` false the named hooks are cleared
    /// instead of set. Unknown opcode names and mode suffixes are
    /// reported here, at load time.
    pub fn apply_spec(&mut self, spec: &str, enable: bool) -> Result<(), PolicyError> {
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, mode) = match entry.split_once(':') {
                Some((name, mode)) => (name, ModeOption::parse(mode)?),
                None => (entry, ModeOption::BA),
            };

            let opcode =
                Opcode::from_name(name).ok_or_else(|| PolicyError::UnknownOpcode(name.to_string()))?;

            let requested = mode.to_modes();
            let slot = &mut self.modes[opcode.to_usize()];
            if enable {
                *slot = slot.union(requested);
            } else {
                if requested.before {
                    slot.before = false;
                }
                if requested.after {
                    slot.after = false;
                }
            }
        }

        Ok(())
    }

    pub fn set(&mut self, opcode: Opcode, modes: AdviceModes) {
        self.modes[opcode.to_usize()] = modes;
    }

    #[inline]
    pub fn modes(&self, opcode: Opcode) -> AdviceModes {
        self.modes[opcode.to_usize()]
    }

    pub fn log_settings(&self) {
        for opcode in Opcode::VARIANTS {
            let modes = self.modes(opcode);
            if modes.any() {
                log::debug!(
                    "advice policy: {} before={} after={}",
                    opcode,
                    modes.before,
                    modes.after
                );
            }
        }
    }
}

/// Selects which methods are instrumented at all. A rejected method is
/// compiled entirely through the uninstrumented templates, whatever the
/// per-opcode policy says. Patterns are exact display names or a
/// prefix followed by `*`.
#[derive(Clone, Debug)]
pub struct MethodFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl MethodFilter {
    /// Includes every method.
    pub fn all() -> MethodFilter {
        MethodFilter {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn new(include: Vec<String>, exclude: Vec<String>) -> MethodFilter {
        MethodFilter { include, exclude }
    }

    pub fn instrument(&self, name: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| Self::matches(p, name));
        included && !self.exclude.iter().any(|p| Self::matches(p, name))
    }

    fn matches(pattern: &str, name: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => pattern == name,
        }
    }
}
