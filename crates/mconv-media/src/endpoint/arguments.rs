//! Declared, flag-backed endpoint settings.
//!
//! Every endpoint kind has a static table of [`ArgumentSpec`]s. A spec maps a
//! setting name to the transcoder flag it is stored under, and optionally to
//! a transform that turns setter arguments into the stored value.

use std::collections::{HashMap, HashSet};

use mconv_models::{is_truthy, value_text, ArgValue};
use serde_json::Value;

use crate::error::{MediaError, MediaResult};

/// Turns setter arguments into the value stored under the flag.
/// `None` leaves the flag unset.
pub type Transform = fn(&[Value]) -> MediaResult<Option<ArgValue>>;

/// Computes a flag from the setter arguments.
pub type FlagFn = fn(&[Value]) -> String;

/// The flag a setting is stored under, without the leading dash.
#[derive(Clone, Copy)]
pub enum Flag {
    Fixed(&'static str),
    Computed(FlagFn),
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(flag) => write!(f, "Fixed({flag})"),
            Self::Computed(_) => f.write_str("Computed"),
        }
    }
}

/// One declared setting.
#[derive(Clone, Copy)]
pub struct ArgumentSpec {
    pub name: &'static str,
    pub flag: Flag,
    pub transform: Option<Transform>,
    /// An empty value is emitted as a bare flag
    pub boolean: bool,
}

impl std::fmt::Debug for ArgumentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgumentSpec")
            .field("name", &self.name)
            .field("flag", &self.flag)
            .field("boolean", &self.boolean)
            .finish_non_exhaustive()
    }
}

impl ArgumentSpec {
    pub const fn new(name: &'static str, flag: &'static str) -> Self {
        Self {
            name,
            flag: Flag::Fixed(flag),
            transform: None,
            boolean: false,
        }
    }

    pub const fn computed(name: &'static str, flag: FlagFn) -> Self {
        Self {
            name,
            flag: Flag::Computed(flag),
            transform: None,
            boolean: false,
        }
    }

    /// A flag that is either present bare or absent.
    pub const fn boolean(name: &'static str, flag: &'static str) -> Self {
        Self {
            name,
            flag: Flag::Fixed(flag),
            transform: Some(boolean_value),
            boolean: true,
        }
    }

    pub const fn with_transform(self, transform: Transform) -> Self {
        Self {
            transform: Some(transform),
            ..self
        }
    }

    /// The flag, when it does not depend on the setter arguments.
    pub fn fixed_flag(&self) -> Option<&'static str> {
        match self.flag {
            Flag::Fixed(flag) => Some(flag),
            Flag::Computed(_) => None,
        }
    }

    fn resolve_flag(&self, args: &[Value]) -> String {
        match self.flag {
            Flag::Fixed(flag) => flag.to_string(),
            Flag::Computed(compute) => compute(args),
        }
    }

    fn value(&self, args: &[Value]) -> MediaResult<Option<ArgValue>> {
        match self.transform {
            Some(transform) => transform(args),
            None => Ok(args.first().and_then(ArgValue::from_json)),
        }
    }
}

/// Bare when called without arguments or with a truthy first argument.
pub fn boolean_value(args: &[Value]) -> MediaResult<Option<ArgValue>> {
    match args.first() {
        None => Ok(Some(ArgValue::bare())),
        Some(value) if is_truthy(value) => Ok(Some(ArgValue::bare())),
        Some(_) => Ok(None),
    }
}

/// Numeric strings become numbers.
pub fn numeric_value(args: &[Value]) -> MediaResult<Option<ArgValue>> {
    Ok(args.first().and_then(|value| match value {
        Value::String(text) => match text.trim().parse::<i64>() {
            Ok(int) => Some(ArgValue::Integer(int)),
            Err(_) => match text.trim().parse::<f64>() {
                Ok(float) => Some(ArgValue::Float(float)),
                Err(_) => ArgValue::from_json(value),
            },
        },
        other => ArgValue::from_json(other),
    }))
}

/// `true` is an endless loop, `false` plays once.
pub fn loop_count(args: &[Value]) -> MediaResult<Option<ArgValue>> {
    Ok(match args.first() {
        Some(Value::Bool(true)) => Some(ArgValue::Integer(-1)),
        Some(Value::Bool(false)) => Some(ArgValue::Integer(0)),
        Some(other) => ArgValue::from_json(other),
        None => None,
    })
}

/// Truthy values enable the flag with `1`.
pub fn enabled_flag(args: &[Value]) -> MediaResult<Option<ArgValue>> {
    Ok(args
        .first()
        .filter(|value| is_truthy(value))
        .map(|_| ArgValue::from("1")))
}

/// `true` is `strict`, `false` is `experimental`, anything else is kept.
pub fn strictness(args: &[Value]) -> MediaResult<Option<ArgValue>> {
    Ok(match args.first() {
        None | Some(Value::Bool(true)) => Some(ArgValue::from("strict")),
        Some(Value::Bool(false)) => Some(ArgValue::from("experimental")),
        Some(other) => ArgValue::from_json(other),
    })
}

/// Hardware acceleration methods the transcoder accepts.
pub const HWACCEL_METHODS: &[&str] = &[
    "none",
    "auto",
    "vda",
    "vdpau",
    "dxva2",
    "vaapi",
    "qsv",
    "cuda",
    "videotoolbox",
];

pub fn hwaccel_method(args: &[Value]) -> MediaResult<Option<ArgValue>> {
    let Some(method) = args.first().and_then(value_text) else {
        return Ok(None);
    };

    if !HWACCEL_METHODS.contains(&method.as_str()) {
        return Err(MediaError::invalid_option(
            "hardware_acceleration",
            format!("unsupported method {method}"),
        ));
    }

    Ok(Some(ArgValue::Text(method)))
}

/// `bitrate("v", "1M")` is stored under `b:v`, `bitrate("1M")` under `b`.
fn bitrate_flag(args: &[Value]) -> String {
    match args {
        [stream, _, ..] => match value_text(stream) {
            Some(stream) => format!("b:{stream}"),
            None => "b".to_string(),
        },
        _ => "b".to_string(),
    }
}

fn bitrate_value(args: &[Value]) -> MediaResult<Option<ArgValue>> {
    let value = if args.len() >= 2 { args.get(1) } else { args.first() };
    Ok(value.and_then(ArgValue::from_json))
}

/// Settings accepted by inputs.
pub static INPUT_ARGUMENTS: &[ArgumentSpec] = &[
    ArgumentSpec::new("format", "f"),
    ArgumentSpec::new("framerate", "r"),
    ArgumentSpec::new("resolution", "video_size"),
    ArgumentSpec::new("duration", "t").with_transform(numeric_value),
    ArgumentSpec::new("loop", "stream_loop").with_transform(loop_count),
    ArgumentSpec::new("video_codec", "c:v"),
    ArgumentSpec::new("audio_codec", "c:a"),
    ArgumentSpec::new("seek", "ss"),
    ArgumentSpec::new("pixel_format", "pix_fmt"),
    ArgumentSpec::new("sw_scaler_flags", "sws_flags"),
    ArgumentSpec::new("hardware_acceleration", "hwaccel").with_transform(hwaccel_method),
    ArgumentSpec::new("hwaccel_device", "hwaccel_device"),
    ArgumentSpec::boolean("native_framerate", "re"),
    ArgumentSpec::boolean("copy_ts", "copyts"),
    ArgumentSpec::new("variable_framerate", "use_wallclock_as_timestamps").with_transform(enabled_flag),
];

/// Settings accepted by outputs.
pub static OUTPUT_ARGUMENTS: &[ArgumentSpec] = &[
    ArgumentSpec::new("format", "f"),
    ArgumentSpec::new("framerate", "r"),
    ArgumentSpec::new("resolution", "video_size"),
    ArgumentSpec::new("bufsize", "bufsize"),
    ArgumentSpec::new("preset", "preset"),
    ArgumentSpec::new("profile", "profile"),
    ArgumentSpec::new("deadline", "deadline"),
    ArgumentSpec::boolean("disable_audio", "an"),
    ArgumentSpec::boolean("disable_video", "vn"),
    ArgumentSpec::new("duration", "t").with_transform(numeric_value),
    ArgumentSpec::new("pixel_format", "pix_fmt"),
    ArgumentSpec::new("video_codec", "c:v"),
    ArgumentSpec::new("audio_codec", "c:a"),
    ArgumentSpec::new("audio_bsf", "bsf:a"),
    ArgumentSpec::new("strict", "strict").with_transform(strictness),
    ArgumentSpec::computed("bitrate", bitrate_flag).with_transform(bitrate_value),
    ArgumentSpec::new("map", "map"),
    ArgumentSpec::new("movflags", "movflags"),
];

/// Settings of the conversion itself, placed before every input.
pub static GLOBAL_ARGUMENTS: &[ArgumentSpec] = &[
    ArgumentSpec::boolean("hide_banner", "hide_banner"),
    ArgumentSpec::boolean("overwrite", "y"),
    ArgumentSpec::new("strict", "strict").with_transform(strictness),
    ArgumentSpec::new("loglevel", "loglevel"),
    ArgumentSpec::new("threads", "threads"),
];

/// Whether an endpoint operation replaces state or appends to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Set,
    Add,
}

/// Non-flag operations an endpoint accepts in bulk assignment.
pub type Operations = &'static [(&'static str, OperationKind)];

pub static INPUT_OPERATIONS: Operations = &[("live", OperationKind::Set), ("arguments", OperationKind::Add)];

pub static OUTPUT_OPERATIONS: Operations = &[
    ("filter", OperationKind::Set),
    ("allow_copy", OperationKind::Set),
    ("arguments", OperationKind::Add),
];

pub static GLOBAL_OPERATIONS: Operations = &[("arguments", OperationKind::Add)];

/// What a bulk-assignment key refers to.
#[derive(Debug, Clone, Copy)]
pub enum OptionTarget {
    Argument(&'static ArgumentSpec),
    Operation(&'static str),
}

/// Resolve a bulk-assignment key.
///
/// Declared names win, then "set" operations, then "add" operations, then
/// a reverse lookup from flag to declared name.
pub fn resolve_option(
    table: &'static [ArgumentSpec],
    operations: Operations,
    key: &str,
) -> Option<OptionTarget> {
    if let Some(spec) = table.iter().find(|spec| spec.name == key) {
        return Some(OptionTarget::Argument(spec));
    }

    for wanted in [OperationKind::Set, OperationKind::Add] {
        if let Some((name, _)) = operations
            .iter()
            .find(|(name, kind)| *kind == wanted && *name == key)
        {
            return Some(OptionTarget::Operation(name));
        }
    }

    let flag = key.trim_start_matches('-');
    table
        .iter()
        .find(|spec| spec.fixed_flag() == Some(flag))
        .map(OptionTarget::Argument)
}

/// Spread a list into separate setter arguments.
pub fn spread(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Insertion-ordered flag storage of one endpoint.
#[derive(Debug, Clone)]
pub struct ArgumentSet {
    endpoint: &'static str,
    table: &'static [ArgumentSpec],
    values: Vec<(String, Option<ArgValue>)>,
    boolean_flags: HashSet<String>,
    /// Declared name to the flag its last set resolved to
    resolved: HashMap<&'static str, String>,
    extra: Vec<String>,
}

impl ArgumentSet {
    pub fn new(endpoint: &'static str, table: &'static [ArgumentSpec]) -> Self {
        Self {
            endpoint,
            table,
            values: Vec::new(),
            boolean_flags: HashSet::new(),
            resolved: HashMap::new(),
            extra: Vec::new(),
        }
    }

    pub fn spec(&self, name: &str) -> Option<&'static ArgumentSpec> {
        self.table.iter().find(|spec| spec.name == name)
    }

    /// Run a declared setter.
    pub fn set(&mut self, name: &str, args: &[Value]) -> MediaResult<()> {
        let spec = self
            .spec(name)
            .ok_or_else(|| MediaError::unknown_option(self.endpoint, name))?;

        let value = spec.value(args)?;
        let flag = spec.resolve_flag(args);

        if spec.boolean {
            self.boolean_flags.insert(flag.clone());
        }
        self.resolved.insert(spec.name, flag.clone());
        self.store(flag, value);

        Ok(())
    }

    fn store(&mut self, flag: String, value: Option<ArgValue>) {
        match self.values.iter_mut().find(|(existing, _)| *existing == flag) {
            Some(entry) => entry.1 = value,
            None => self.values.push((flag, value)),
        }
    }

    /// Value of a declared setting.
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        let flag = match self.resolved.get(name) {
            Some(flag) => flag.as_str(),
            None => self.spec(name)?.fixed_flag()?,
        };
        self.flag_value(flag)
    }

    /// Value stored under a flag.
    pub fn flag_value(&self, flag: &str) -> Option<&ArgValue> {
        self.values
            .iter()
            .find(|(existing, _)| existing == flag)
            .and_then(|(_, value)| value.as_ref())
    }

    /// Look `key` up as a declared name, then as a flag.
    pub fn lookup(&self, key: &str) -> Option<&ArgValue> {
        if self.spec(key).is_some() {
            return self.get(key);
        }
        self.flag_value(key.trim_start_matches('-'))
    }

    /// Declared setting rendered as text.
    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).map(ToString::to_string)
    }

    pub fn add_extra<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra.extend(args.into_iter().map(Into::into));
    }

    pub fn extra(&self) -> &[String] {
        &self.extra
    }

    /// Serialise the flags in insertion order.
    ///
    /// `overrides` replaces the value of the named flags. Unset flags are
    /// skipped, and empty values are emitted bare only for boolean flags.
    pub fn flag_tokens(&self, overrides: &[(&str, &str)]) -> Vec<String> {
        let mut tokens = Vec::new();

        for (flag, value) in &self.values {
            let Some(value) = value else { continue };

            if value.is_bare() {
                if self.boolean_flags.contains(flag) {
                    tokens.push(format!("-{flag}"));
                }
                continue;
            }

            tokens.push(format!("-{flag}"));
            match overrides.iter().find(|(name, _)| name == flag) {
                Some((_, replacement)) => tokens.push((*replacement).to_string()),
                None => tokens.push(value.to_string()),
            }
        }

        tokens
    }

    /// Flags followed by the extra arguments.
    pub fn to_tokens(&self) -> Vec<String> {
        let mut tokens = self.flag_tokens(&[]);
        tokens.extend(self.extra.iter().cloned());
        tokens
    }
}
