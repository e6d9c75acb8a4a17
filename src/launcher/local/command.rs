//! Building the command line for a local test process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::LaunchError;

use super::process::LaunchCommand;
use super::LocalLaunchConfig;

/// Property naming where a run stores its results.
pub const RAS_STORE_PROPERTY: &str = "framework.resultarchive.store";

/// Property giving the prefix of locally allocated run names.
pub const LOCAL_RUN_PREFIX_PROPERTY: &str = "framework.request.type.LOCAL.prefix";

const LOCAL_RUN_PREFIX: &str = "L";

/// Property selecting the formats 3270 terminal images are saved in.
pub const TERMINAL_OUTPUT_PROPERTY: &str = "zos3270.terminal.output";

const TERMINAL_OUTPUT_FORMATS: &str = "json,png";

/// Bootstrap property holding extra JVM options, separated by spaces.
pub const JVM_LAUNCH_OPTIONS_PROPERTY: &str = "galasactl.jvm.local.launch.options";

/// Bootstrap property giving the debug port when none is passed.
pub const DEBUG_PORT_PROPERTY: &str = "galasactl.jvm.local.launch.debug.port";

/// Bootstrap property giving the debug mode when none is passed.
pub const DEBUG_MODE_PROPERTY: &str = "galasactl.jvm.local.launch.debug.mode";

pub const DEFAULT_DEBUG_PORT: u32 = 2970;

/// How the JVM's debug agent meets the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    /// The JVM waits for a debugger to connect to its port.
    Listen,
    /// The JVM connects out to a debugger already listening on the port.
    Attach,
}

impl DebugMode {
    /// Case-insensitive `listen` or `attach`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "listen" => Some(Self::Listen),
            "attach" => Some(Self::Attach),
            _ => None,
        }
    }

    fn server_flag(self) -> &'static str {
        match self {
            Self::Listen => "y",
            Self::Attach => "n",
        }
    }
}

/// What a local process is asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestSelection {
    Class { bundle: String, class: String },
    Gherkin { url: String, feature: String },
}

impl TestSelection {
    /// Chooses between a class and a gherkin feature for one request.
    pub fn from_parts(class_name: &str, gherkin_url: &str) -> Result<Self, LaunchError> {
        if !gherkin_url.is_empty() {
            let feature = gherkin_feature_name(gherkin_url)?;
            return Ok(Self::Gherkin {
                url: gherkin_url.to_string(),
                feature,
            });
        }
        let (bundle, class) = split_class_name(class_name)?;
        Ok(Self::Class { bundle, class })
    }

    pub fn bundle(&self) -> &str {
        match self {
            Self::Class { bundle, .. } => bundle,
            Self::Gherkin { .. } => "",
        }
    }

    pub fn test_name(&self) -> &str {
        match self {
            Self::Class { class, .. } => class,
            Self::Gherkin { feature, .. } => feature,
        }
    }
}

/// Splits `<bundle>/<class>` into its halves.
pub fn split_class_name(class_name: &str) -> Result<(String, String), LaunchError> {
    let parts: Vec<&str> = class_name.split('/').collect();
    match parts.as_slice() {
        [bundle, class] if !bundle.is_empty() && !class.is_empty() => {
            if class.ends_with(".class") {
                return Err(LaunchError::ClassHasSuffix(class_name.to_string()));
            }
            Ok((bundle.to_string(), class.to_string()))
        }
        [_, _] | [_] => Err(LaunchError::ClassMissingSlash(class_name.to_string())),
        _ => Err(LaunchError::ClassTooManySlashes(class_name.to_string())),
    }
}

/// Returns the feature name of a `file://.../<name>.feature` URL.
pub fn gherkin_feature_name(url: &str) -> Result<String, LaunchError> {
    let invalid = || LaunchError::InvalidGherkinUrl(url.to_string());
    if !url.starts_with("file://") {
        return Err(invalid());
    }
    let stem = url.strip_suffix(".feature").ok_or_else(invalid)?;
    let feature = stem.rsplit('/').next().unwrap_or_default();
    if feature.is_empty() {
        return Err(invalid());
    }
    Ok(feature.to_string())
}

/// Splits a comma separated obr list, dropping blanks.
pub fn parse_obrs(obr: &str) -> Vec<String> {
    obr.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// The request overrides plus the properties every local run needs.
/// Values already present in the request are left alone.
pub fn effective_overrides(
    home: &Path,
    requested: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut overrides = requested.clone();
    overrides
        .entry(RAS_STORE_PROPERTY.to_string())
        .or_insert_with(|| format!("file://{}", home.join("ras").display()));
    overrides
        .entry(LOCAL_RUN_PREFIX_PROPERTY.to_string())
        .or_insert_with(|| LOCAL_RUN_PREFIX.to_string());
    overrides
        .entry(TERMINAL_OUTPUT_PROPERTY.to_string())
        .or_insert_with(|| TERMINAL_OUTPUT_FORMATS.to_string());
    overrides
}

fn bootstrap_value<'a>(config: &'a LocalLaunchConfig, key: &str) -> Option<&'a str> {
    config
        .bootstrap_properties
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

/// The debug mode flag, else the bootstrap's, else listen.
pub fn resolve_debug_mode(config: &LocalLaunchConfig) -> Result<DebugMode, LaunchError> {
    let (value, origin) = match config.debug_mode.as_deref().filter(|m| !m.trim().is_empty()) {
        Some(flag) => (flag, "--debug-mode"),
        None => match bootstrap_value(config, DEBUG_MODE_PROPERTY) {
            Some(property) => (property, DEBUG_MODE_PROPERTY),
            None => return Ok(DebugMode::Listen),
        },
    };
    DebugMode::parse(value).ok_or_else(|| LaunchError::InvalidDebugMode {
        value: value.to_string(),
        origin,
    })
}

/// The debug port flag, else the bootstrap's, else [`DEFAULT_DEBUG_PORT`].
/// A flag of zero counts as unset.
pub fn resolve_debug_port(config: &LocalLaunchConfig) -> Result<u32, LaunchError> {
    if let Some(port) = config.debug_port.filter(|port| *port != 0) {
        return Ok(port);
    }
    match bootstrap_value(config, DEBUG_PORT_PROPERTY) {
        Some(value) => value.parse().map_err(|_| LaunchError::InvalidDebugPort {
            value: value.to_string(),
            property: DEBUG_PORT_PROPERTY,
        }),
        None => Ok(DEFAULT_DEBUG_PORT),
    }
}

/// Extra JVM options from the bootstrap, in the order given.
pub fn jvm_launch_options(config: &LocalLaunchConfig) -> Vec<String> {
    bootstrap_value(config, JVM_LAUNCH_OPTIONS_PROPERTY)
        .map(|options| options.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Renders overrides as a properties file body.
pub fn render_properties(overrides: &BTreeMap<String, String>) -> String {
    let mut body = String::new();
    for (key, value) in overrides {
        body.push_str(&escape_property(key, true));
        body.push('=');
        body.push_str(&escape_property(value, false));
        body.push('\n');
    }
    body
}

fn escape_property(text: &str, is_key: bool) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            '=' | ':' | ' ' if is_key => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Writes the overrides file into `folder` and returns its path.
pub fn write_overrides_file(
    folder: &Path,
    overrides: &BTreeMap<String, String>,
) -> Result<PathBuf, LaunchError> {
    let path = folder.join("overrides.properties");
    std::fs::write(&path, render_properties(overrides))?;
    Ok(path)
}

/// Builds the full command line for one test.
///
/// All JVM options come before `-jar`, otherwise the JVM hands them to the
/// boot jar as program arguments. The debug agent goes first, then the
/// bootstrap's launch options, then the `-D` system properties.
pub fn build_command(
    config: &LocalLaunchConfig,
    obrs: &[String],
    selection: &TestSelection,
    overrides_file: &Path,
    trace: bool,
) -> Result<LaunchCommand, LaunchError> {
    if obrs.is_empty() {
        if let TestSelection::Class { bundle, class } = selection {
            return Err(LaunchError::MissingObr(format!("{}/{}", bundle, class)));
        }
    }

    let program = config
        .java_home
        .join("bin")
        .join("java")
        .display()
        .to_string();

    let mut args = Vec::new();
    if config.debug {
        let port = resolve_debug_port(config)?;
        let mode = resolve_debug_mode(config)?;
        args.push(format!(
            "-agentlib:jdwp=transport=dt_socket,address=*:{},server={},suspend=y",
            port,
            mode.server_flag()
        ));
    }
    args.extend(jvm_launch_options(config));

    args.extend([
        "-Dfile.encoding=UTF-8".to_string(),
        format!("-DGALASA_HOME=\"{}\"", config.home.display()),
        "-jar".to_string(),
        config.boot_jar().display().to_string(),
        "--localmaven".to_string(),
        config.local_maven.clone(),
        "--remotemaven".to_string(),
        config.remote_maven.clone(),
        "--bootstrap".to_string(),
        config.bootstrap_url(),
        "--overrides".to_string(),
        format!("file://{}", overrides_file.display()),
        "--obr".to_string(),
        config.framework_obr(),
    ]);

    for obr in obrs {
        args.push("--obr".to_string());
        args.push(obr.clone());
    }

    match selection {
        TestSelection::Class { bundle, class } => {
            args.push("--test".to_string());
            args.push(format!("{}/{}", bundle, class));
        }
        TestSelection::Gherkin { url, .. } => {
            args.push("--gherkin".to_string());
            args.push(url.clone());
        }
    }

    if trace {
        args.push("--trace".to_string());
    }

    Ok(LaunchCommand { program, args })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LocalLaunchConfig {
        LocalLaunchConfig::new("/java", "/home/tester/.testrun", "file:///home/tester/.m2/repository")
    }

    fn class_selection() -> TestSelection {
        TestSelection::from_parts("my.bundle/my.bundle.MyTest", "").unwrap()
    }

    #[test]
    fn test_split_class_name() {
        let (bundle, class) = split_class_name("my.bundle/my.bundle.MyTest").unwrap();
        assert_eq!(bundle, "my.bundle");
        assert_eq!(class, "my.bundle.MyTest");
    }

    #[test]
    fn test_class_name_validation_errors() {
        assert!(matches!(
            split_class_name("my.bundle.MyTest"),
            Err(LaunchError::ClassMissingSlash(_))
        ));
        assert!(matches!(
            split_class_name("/my.bundle.MyTest"),
            Err(LaunchError::ClassMissingSlash(_))
        ));
        assert!(matches!(
            split_class_name("a/b/c"),
            Err(LaunchError::ClassTooManySlashes(_))
        ));
        assert!(matches!(
            split_class_name("my.bundle/my.bundle.MyTest.class"),
            Err(LaunchError::ClassHasSuffix(_))
        ));
    }

    #[test]
    fn test_gherkin_feature_name() {
        assert_eq!(
            gherkin_feature_name("file:///features/login.feature").unwrap(),
            "login"
        );
        assert!(gherkin_feature_name("http://host/login.feature").is_err());
        assert!(gherkin_feature_name("file:///features/login.txt").is_err());
        assert!(gherkin_feature_name("file:///features/.feature").is_err());
    }

    #[test]
    fn test_system_properties_come_before_jar() {
        let command = build_command(
            &config(),
            &["mvn:my.group/my.obr/0.1/obr".to_string()],
            &class_selection(),
            Path::new("/tmp/x/overrides.properties"),
            false,
        )
        .unwrap();

        let jar = command.args.iter().position(|a| a == "-jar").unwrap();
        let encoding = command
            .args
            .iter()
            .position(|a| a == "-Dfile.encoding=UTF-8")
            .unwrap();
        let home = command
            .args
            .iter()
            .position(|a| a == "-DGALASA_HOME=\"/home/tester/.testrun\"")
            .unwrap();
        assert!(encoding < jar);
        assert!(home < jar);
        assert_eq!(command.program, "/java/bin/java");
    }

    #[test]
    fn test_command_lists_framework_obr_then_user_obrs() {
        let command = build_command(
            &config(),
            &["mvn:a/b/1/obr".to_string(), "mvn:c/d/2/obr".to_string()],
            &class_selection(),
            Path::new("/tmp/x/overrides.properties"),
            true,
        )
        .unwrap();

        let obrs: Vec<&String> = command
            .args
            .windows(2)
            .filter(|pair| pair[0] == "--obr")
            .map(|pair| &pair[1])
            .collect();
        assert_eq!(obrs.len(), 3);
        assert_eq!(obrs[0], &config().framework_obr());
        assert_eq!(obrs[1], "mvn:a/b/1/obr");
        assert_eq!(obrs[2], "mvn:c/d/2/obr");

        assert!(command
            .args
            .windows(2)
            .any(|pair| pair[0] == "--test" && pair[1] == "my.bundle/my.bundle.MyTest"));
        assert_eq!(command.args.last().map(String::as_str), Some("--trace"));
        assert!(command
            .args
            .contains(&"file:///tmp/x/overrides.properties".to_string()));
    }

    #[test]
    fn test_trace_omitted_when_disabled() {
        let command = build_command(
            &config(),
            &["mvn:a/b/1/obr".to_string()],
            &class_selection(),
            Path::new("/tmp/overrides.properties"),
            false,
        )
        .unwrap();
        assert!(!command.args.contains(&"--trace".to_string()));
    }

    #[test]
    fn test_class_without_obr_is_rejected() {
        let result = build_command(
            &config(),
            &[],
            &class_selection(),
            Path::new("/tmp/overrides.properties"),
            false,
        );
        assert!(matches!(result, Err(LaunchError::MissingObr(_))));
    }

    #[test]
    fn test_gherkin_needs_no_obr() {
        let selection = TestSelection::from_parts("", "file:///f/login.feature").unwrap();
        let command = build_command(
            &config(),
            &[],
            &selection,
            Path::new("/tmp/overrides.properties"),
            false,
        )
        .unwrap();
        assert!(command
            .args
            .windows(2)
            .any(|pair| pair[0] == "--gherkin" && pair[1] == "file:///f/login.feature"));
        assert_eq!(selection.test_name(), "login");
    }

    #[test]
    fn test_standard_overrides_do_not_replace_requested_ones() {
        let mut requested = BTreeMap::new();
        requested.insert(RAS_STORE_PROPERTY.to_string(), "file:///elsewhere".to_string());
        requested.insert("my.prop".to_string(), "1".to_string());

        let overrides = effective_overrides(Path::new("/home/t/.testrun"), &requested);

        assert_eq!(overrides[RAS_STORE_PROPERTY], "file:///elsewhere");
        assert_eq!(overrides[LOCAL_RUN_PREFIX_PROPERTY], "L");
        assert_eq!(overrides["my.prop"], "1");

        let defaults = effective_overrides(Path::new("/home/t/.testrun"), &BTreeMap::new());
        assert_eq!(defaults[RAS_STORE_PROPERTY], "file:///home/t/.testrun/ras");
        assert_eq!(defaults[TERMINAL_OUTPUT_PROPERTY], "json,png");
    }

    #[test]
    fn test_requested_terminal_output_is_kept() {
        let mut requested = BTreeMap::new();
        requested.insert(TERMINAL_OUTPUT_PROPERTY.to_string(), "png".to_string());

        let overrides = effective_overrides(Path::new("/h"), &requested);

        assert_eq!(overrides[TERMINAL_OUTPUT_PROPERTY], "png");
    }

    fn debug_config(bootstrap: &[(&str, &str)]) -> LocalLaunchConfig {
        let mut config = config();
        config.debug = true;
        config.bootstrap_properties = bootstrap
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config
    }

    fn command_for(config: &LocalLaunchConfig) -> Result<LaunchCommand, LaunchError> {
        build_command(
            config,
            &["mvn:a/b/1/obr".to_string()],
            &class_selection(),
            Path::new("/tmp/overrides.properties"),
            false,
        )
    }

    #[test]
    fn test_debug_agent_defaults_to_listen_on_default_port() {
        let command = command_for(&debug_config(&[])).unwrap();

        assert_eq!(
            command.args[0],
            "-agentlib:jdwp=transport=dt_socket,address=*:2970,server=y,suspend=y"
        );
        assert_eq!(command.args[1], "-Dfile.encoding=UTF-8");
    }

    #[test]
    fn test_debug_flags_win_over_bootstrap() {
        let mut config = debug_config(&[(DEBUG_PORT_PROPERTY, "345"), (DEBUG_MODE_PROPERTY, "listen")]);
        config.debug_port = Some(5005);
        config.debug_mode = Some("ATTACH".to_string());

        let command = command_for(&config).unwrap();

        assert_eq!(
            command.args[0],
            "-agentlib:jdwp=transport=dt_socket,address=*:5005,server=n,suspend=y"
        );
    }

    #[test]
    fn test_debug_settings_fall_back_to_bootstrap() {
        let mut config = debug_config(&[(DEBUG_PORT_PROPERTY, "345"), (DEBUG_MODE_PROPERTY, "attach")]);
        config.debug_port = Some(0);

        assert_eq!(resolve_debug_port(&config).unwrap(), 345);
        assert_eq!(resolve_debug_mode(&config).unwrap(), DebugMode::Attach);
    }

    #[test]
    fn test_bad_debug_settings_are_rejected() {
        let mut config = debug_config(&[(DEBUG_PORT_PROPERTY, "-456")]);
        assert!(matches!(
            command_for(&config),
            Err(LaunchError::InvalidDebugPort { value, .. }) if value == "-456"
        ));

        config.bootstrap_properties.clear();
        config.debug_mode = Some("shout".to_string());
        assert!(matches!(
            command_for(&config),
            Err(LaunchError::InvalidDebugMode { value, origin }) if value == "shout" && origin == "--debug-mode"
        ));

        config.debug_mode = None;
        config
            .bootstrap_properties
            .insert(DEBUG_MODE_PROPERTY.to_string(), "wait".to_string());
        assert!(matches!(
            resolve_debug_mode(&config),
            Err(LaunchError::InvalidDebugMode { origin, .. }) if origin == DEBUG_MODE_PROPERTY
        ));
    }

    #[test]
    fn test_debug_settings_ignored_when_debug_is_off() {
        let mut config = debug_config(&[(DEBUG_PORT_PROPERTY, "not-a-port")]);
        config.debug = false;

        let command = command_for(&config).unwrap();

        assert!(!command.args.iter().any(|a| a.starts_with("-agentlib")));
    }

    #[test]
    fn test_bootstrap_launch_options_come_before_system_properties() {
        let config = debug_config(&[(JVM_LAUNCH_OPTIONS_PROPERTY, "  -Xmx40m   -Xms20m ")]);

        let command = command_for(&config).unwrap();

        assert!(command.args[0].starts_with("-agentlib:jdwp"));
        assert_eq!(command.args[1], "-Xmx40m");
        assert_eq!(command.args[2], "-Xms20m");
        assert_eq!(command.args[3], "-Dfile.encoding=UTF-8");

        let mut quiet = config;
        quiet.debug = false;
        let command = command_for(&quiet).unwrap();
        assert_eq!(command.args[0], "-Xmx40m");
    }

    #[test]
    fn test_overrides_file_written() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut overrides = BTreeMap::new();
        overrides.insert("a.b".to_string(), "x=y".to_string());
        overrides.insert("key with space".to_string(), "v".to_string());

        let path = write_overrides_file(dir.path(), &overrides).unwrap();
        let body = std::fs::read_to_string(path).unwrap();

        assert!(body.contains("a.b=x=y\n"));
        assert!(body.contains("key\\ with\\ space=v\n"));
    }

    #[test]
    fn test_parse_obrs() {
        assert_eq!(
            parse_obrs("mvn:a/b/1/obr, mvn:c/d/2/obr,,"),
            vec!["mvn:a/b/1/obr".to_string(), "mvn:c/d/2/obr".to_string()]
        );
        assert!(parse_obrs("").is_empty());
    }
}
