//! Boot-time configuration.
//!
//! The kernel is configured from a command line of whitespace-separated
//! `key=value` tokens, e.g. `format=on policy=clock swap=on frames=8 log=debug`.
//! Anything not mentioned keeps its default.

use crate::fs::NUM_DIR_ENTRIES;
use core::fmt;
use log::LevelFilter;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, rest, value},
    sequence::separated_pair,
    IResult,
};
use sectoros_shared::mem::{NUM_PHYS_PAGES, TLB_SIZE};

/// Page replacement strategy used when no physical frame is free.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReplacementKind {
    Fifo,
    Clock,
    Random,
}

#[derive(Clone, Debug)]
pub struct FsConfig {
    /// Write a fresh, empty volume instead of mounting the disk's contents.
    pub format: bool,
    /// Slots in a newly created directory table.
    pub directory_entries: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            format: false,
            directory_entries: NUM_DIR_ENTRIES,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VmConfig {
    pub policy: ReplacementKind,
    /// Load pages on first touch instead of when the address space is built.
    pub demand_loading: bool,
    /// Evict to a per-process swap file when memory is full. Needs demand loading.
    pub swap: bool,
    pub num_frames: usize,
    pub tlb_size: usize,
    /// Seed of the random replacement policy.
    pub seed: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            policy: ReplacementKind::Fifo,
            demand_loading: true,
            swap: true,
            num_frames: NUM_PHYS_PAGES,
            tlb_size: TLB_SIZE,
            seed: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct KernelConfig {
    pub log_level: LevelFilter,
    pub fs: FsConfig,
    pub vm: VmConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            fs: FsConfig::default(),
            vm: VmConfig::default(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConfigError {
    /// A token that is not `key=value`.
    Malformed,
    UnknownKey,
    BadValue,
    /// Swap without demand loading, or a zero-sized resource.
    Inconsistent,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "expected key=value"),
            Self::UnknownKey => write!(f, "unknown option"),
            Self::BadValue => write!(f, "invalid option value"),
            Self::Inconsistent => write!(f, "options contradict each other"),
        }
    }
}

impl core::error::Error for ConfigError {}

fn assignment(input: &str) -> IResult<&str, (&str, &str)> {
    all_consuming(separated_pair(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        char('='),
        rest,
    ))(input)
}

fn switch(input: &str) -> IResult<&str, bool> {
    alt((
        value(true, alt((tag("on"), tag("true"), tag("yes")))),
        value(false, alt((tag("off"), tag("false"), tag("no")))),
    ))(input)
}

fn number<T: core::str::FromStr>(input: &str) -> IResult<&str, T> {
    map_res(digit1, str::parse)(input)
}

fn policy(input: &str) -> IResult<&str, ReplacementKind> {
    alt((
        value(ReplacementKind::Fifo, tag("fifo")),
        value(ReplacementKind::Clock, tag("clock")),
        value(ReplacementKind::Random, tag("random")),
    ))(input)
}

fn level(input: &str) -> IResult<&str, LevelFilter> {
    alt((
        value(LevelFilter::Off, tag("off")),
        value(LevelFilter::Error, tag("error")),
        value(LevelFilter::Warn, tag("warn")),
        value(LevelFilter::Info, tag("info")),
        value(LevelFilter::Debug, tag("debug")),
        value(LevelFilter::Trace, tag("trace")),
    ))(input)
}

/// Runs `parser` over the whole of `input`.
fn parse_value<'a, T>(
    input: &'a str,
    parser: impl FnMut(&'a str) -> IResult<&'a str, T>,
) -> Result<T, ConfigError> {
    all_consuming(parser)(input)
        .map(|(_, out)| out)
        .map_err(|_| ConfigError::BadValue)
}

impl KernelConfig {
    pub fn parse(cmdline: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for token in cmdline.split_whitespace() {
            let (_, (key, raw)) = assignment(token).map_err(|_| ConfigError::Malformed)?;
            match key {
                "log" => config.log_level = parse_value(raw, level)?,
                "format" => config.fs.format = parse_value(raw, switch)?,
                "dir_entries" => config.fs.directory_entries = parse_value(raw, number)?,
                "policy" => config.vm.policy = parse_value(raw, policy)?,
                "demand" => config.vm.demand_loading = parse_value(raw, switch)?,
                "swap" => config.vm.swap = parse_value(raw, switch)?,
                "frames" => config.vm.num_frames = parse_value(raw, number)?,
                "tlb" => config.vm.tlb_size = parse_value(raw, number)?,
                "seed" => config.vm.seed = parse_value(raw, number)?,
                _ => return Err(ConfigError::UnknownKey),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let vm = &self.vm;
        if vm.swap && !vm.demand_loading {
            return Err(ConfigError::Inconsistent);
        }
        if vm.num_frames == 0 || vm.tlb_size == 0 || self.fs.directory_entries == 0 {
            return Err(ConfigError::Inconsistent);
        }
        Ok(())
    }
}
