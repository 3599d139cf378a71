/// Application name, used in the HTTP user agent.
pub const APP_NAME: &str = "kiln";

/// Default output directory, relative to the project root.
pub const DEFAULT_OUT_DIR: &str = "kiln-out";

/// Project configuration file.
pub const CONFIG_FILENAME: &str = ".kiln.toml";

/// Local, uncommitted configuration overrides.
pub const LOCAL_CONFIG_FILENAME: &str = ".kiln.local.toml";

/// Default action graph file consumed by the CLI.
pub const GRAPH_FILENAME: &str = "kiln-graph.json";

/// Environment variable overriding the output directory.
pub const OUT_DIR_ENV: &str = "KILN_OUT";

/// Environment variable overriding the configured thread count.
pub const THREADS_ENV: &str = "KILN_THREADS";

/// Width of a rule key in bytes (160 bits).
pub const RULE_KEY_BYTES: usize = 20;

/// Version of the persisted build-info record format.
pub const BUILD_INFO_VERSION: u32 = 1;

/// Version of the dependency-file manifest format stored in the artifact cache.
pub const MANIFEST_VERSION: u32 = 1;
