// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod config;

use {
    crate::{
        cli::config::{Config, ConfigBuilder, ResignConfig},
        entitlements::load_entitlements_file,
        error::ResignError,
        identifier::collect_identifier_mappings,
        inspect::{display_relative, AppInfo},
        pipeline::{resolve_main_app, Resigner},
        profile::Profile,
        settings::ResignSettings,
        signing_service::CodesignTool,
    },
    clap::{ArgAction, Parser, Subcommand},
    ipa_bundles::{read_manifest_identifier, scan_bundles},
    log::{warn, LevelFilter},
    std::path::PathBuf,
};

/// Holds state to pass to CLI commands.
pub struct Context {
    pub config: Config,
    pub verbose: u8,
}

pub trait CliCommand {
    /// Obtain the current command arguments normalized to a [Config] instance.
    fn as_config(&self) -> Result<Option<Config>, ResignError> {
        Ok(None)
    }

    /// Runs the command.
    fn run(&self, context: &Context) -> Result<(), ResignError>;
}

#[derive(Parser)]
struct Resign {
    /// Path to an application bundle, a Payload directory, or an extracted .ipa
    path: PathBuf,

    /// Code signing identity: a certificate common name or SHA-1 fingerprint.
    ///
    /// If not given, it is derived from the provisioning profile's developer
    /// certificates and the identities in your keychain.
    #[arg(short = 's', long, value_name = "IDENTITY")]
    sign_identity: Option<String>,

    /// Provisioning profile to embed and take entitlements from
    #[arg(short = 'p', long, value_name = "PATH")]
    profile: Option<PathBuf>,

    /// Entitlements plist to sign every bundle with
    #[arg(short = 'e', long, value_name = "PATH")]
    entitlements: Option<PathBuf>,

    /// Name of the main application when Payload/ contains several
    #[arg(long, value_name = "NAME")]
    main_app_name: Option<String>,

    /// Require entitlements to declare an application identifier
    #[arg(long)]
    strict_entitlements: bool,

    /// New bundle identifier of the main application.
    ///
    /// Nested bundles whose identifiers are prefixed by the old identifier are
    /// renamed accordingly.
    #[arg(short = 'b', long, value_name = "ID")]
    bundle_id: Option<String>,

    /// New CFBundleShortVersionString
    #[arg(long, value_name = "VERSION")]
    bundle_version: Option<String>,

    /// New CFBundleVersion
    #[arg(short = 'n', long, value_name = "BUILD")]
    build: Option<String>,

    /// New CFBundleDisplayName (also sets CFBundleName)
    #[arg(short = 'd', long, value_name = "NAME")]
    display_name: Option<String>,

    /// Rewrite every Info.plist string value derived from the old bundle identifier
    #[arg(long)]
    rewrite_bundle_id_values: bool,

    /// Report what would change without modifying anything
    #[arg(long)]
    dry_run: bool,
}

impl Resign {
    fn resolve_identity(
        &self,
        c: &ResignConfig,
        profile: Option<&Profile>,
        tool: &CodesignTool,
    ) -> Result<Option<String>, ResignError> {
        if let Some(identity) = &c.sign_identity {
            return Ok(Some(identity.clone()));
        }

        if let Some(profile) = profile {
            let identities = match tool.find_identities() {
                Ok(identities) => identities,
                Err(e) => {
                    warn!("unable to list keychain identities: {}", e);
                    vec![]
                }
            };

            let identity = profile.resolve_signing_identity(&identities)?;
            warn!("using signing identity from provisioning profile: {}", identity);

            return Ok(Some(identity));
        }

        if self.dry_run {
            Ok(None)
        } else {
            Err(ResignError::NoSigningIdentity)
        }
    }
}

impl CliCommand for Resign {
    fn as_config(&self) -> Result<Option<Config>, ResignError> {
        Ok(Some(Config {
            resign: ResignConfig {
                sign_identity: self.sign_identity.clone(),
                profile: self.profile.clone(),
                entitlements: self.entitlements.clone(),
                main_app_name: self.main_app_name.clone(),
                strict_entitlements: self.strict_entitlements.then_some(true),
            },
        }))
    }

    fn run(&self, context: &Context) -> Result<(), ResignError> {
        let c = &context.config.resign;

        let tool = CodesignTool::new(context.verbose > 0);
        let mut settings = ResignSettings::default();
        settings.set_verbose(context.verbose > 0);

        if let Some(path) = &c.entitlements {
            warn!("using entitlements from {}", path.display());
            settings.set_entitlements(load_entitlements_file(path)?);
        }

        if let Some(path) = &c.profile {
            let profile = Profile::from_path(path)?;
            warn!(
                "using provisioning profile {} (team {})",
                profile.name().unwrap_or("<unnamed>"),
                profile.team_id
            );
            settings.set_profile(profile, path);
        }

        let identity = self.resolve_identity(c, settings.profile(), &tool)?;
        if let Some(identity) = identity {
            settings.set_signing_identity(identity);
        }

        if let Some(name) = &c.main_app_name {
            settings.set_main_app_name(name);
        }
        settings.set_strict_entitlements(c.strict_entitlements.unwrap_or_default());

        if let Some(id) = &self.bundle_id {
            settings.set_bundle_id(id);
        }
        if let Some(version) = &self.bundle_version {
            settings.set_bundle_version(version);
        }
        if let Some(build) = &self.build {
            settings.set_build(build);
        }
        if let Some(name) = &self.display_name {
            settings.set_display_name(name);
        }
        settings.set_rewrite_bundle_id_values(self.rewrite_bundle_id_values);
        settings.set_dry_run(self.dry_run);

        let report = Resigner::new(settings, &tool).resign(&self.path)?;
        println!("{}", report);

        Ok(())
    }
}

#[derive(Parser)]
struct Inspect {
    /// Path to an application bundle, a Payload directory, or an extracted .ipa
    path: PathBuf,

    /// Name of the main application when Payload/ contains several
    #[arg(long, value_name = "NAME")]
    main_app_name: Option<String>,
}

impl CliCommand for Inspect {
    fn run(&self, context: &Context) -> Result<(), ResignError> {
        let main_app = resolve_main_app(&self.path, self.main_app_name.as_deref())?;

        let tool = CodesignTool::new(context.verbose > 0);
        let info =
            AppInfo::from_main_app(&main_app)?.with_signature(tool.signature_info(&main_app));
        println!("{}", info);

        Ok(())
    }
}

#[derive(Parser)]
struct PlanIdentifiers {
    /// Path to an application bundle, a Payload directory, or an extracted .ipa
    path: PathBuf,

    /// New bundle identifier of the main application
    #[arg(short = 'b', long, value_name = "ID")]
    bundle_id: String,

    /// Name of the main application when Payload/ contains several
    #[arg(long, value_name = "NAME")]
    main_app_name: Option<String>,
}

impl CliCommand for PlanIdentifiers {
    fn run(&self, _context: &Context) -> Result<(), ResignError> {
        let new_main_id = self.bundle_id.trim();
        if new_main_id.is_empty() {
            return Err(ResignError::CliGeneralError(
                "--bundle-id must not be empty".into(),
            ));
        }

        let main_app = resolve_main_app(&self.path, self.main_app_name.as_deref())?;

        let old_main_id = read_manifest_identifier(&main_app)
            .ok_or_else(|| ResignError::BundleNoIdentifier(main_app.clone()))?;

        let bundles = scan_bundles(&main_app);
        let mappings = collect_identifier_mappings(&bundles, &old_main_id, new_main_id);

        for path in &bundles {
            let rel = display_relative(path, &main_app);

            match mappings.get(path) {
                Some(mapping) if mapping.changed() => println!("{}: {}", rel, mapping),
                Some(mapping) => println!("{}: {} (unchanged)", rel, mapping.old),
                None => println!("{}: <no identifier>", rel),
            }
        }

        Ok(())
    }
}

#[derive(Subcommand)]
enum Subcommands {
    /// Re-sign an application with a new identity.
    ///
    /// Every nested bundle (app extensions, watch applications, XPC services),
    /// framework, and dynamic library is signed again with `codesign`, nested
    /// content before its container. The main application is strictly verified
    /// afterwards.
    ///
    /// Each bundle is signed with entitlements from --entitlements if given,
    /// else from its existing signature, else from the provisioning profile.
    /// When the bundle identifier changes, identity bearing entitlements are
    /// rewritten and validated before anything is modified.
    #[command(verbatim_doc_comment)]
    Resign(Resign),

    /// Print application metadata, its current signature, its bundles, and the
    /// order they are signed in
    Inspect(Inspect),

    /// Print how bundle identifiers would change for a new main identifier
    PlanIdentifiers(PlanIdentifiers),
}

impl Subcommands {
    fn as_cli_command(&self) -> &dyn CliCommand {
        match self {
            Subcommands::Resign(c) => c,
            Subcommands::Inspect(c) => c,
            Subcommands::PlanIdentifiers(c) => c,
        }
    }
}

/// Re-sign iOS applications with a new bundle identifier, profile, and entitlements
#[derive(Parser)]
#[command(author, version, arg_required_else_help = true)]
struct Cli {
    /// Explicit configuration file to load.
    ///
    /// If provided, the default configuration files are not loaded, even
    /// if they exist.
    ///
    /// Can be specified multiple times. Files are loaded/merged in the order
    /// given.
    ///
    /// The special value `/dev/null` can be used to specify an empty/null
    /// config file. It can be used to short-circuit loading of default config
    /// files.
    #[arg(short = 'C', long = "config-file", global = true)]
    config_path: Vec<PathBuf>,

    /// Configuration profile to load.
    ///
    /// If not specified, the implicit "default" profile is loaded.
    #[arg(short = 'P', long = "profile-name", global = true)]
    config_profile: Option<String>,

    /// Increase logging verbosity. Can be specified multiple times
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Subcommands,
}

impl Cli {
    pub fn config_builder(&self) -> ConfigBuilder {
        let mut config = ConfigBuilder::default();

        config = if self.config_path.is_empty() {
            config.with_user_config_file().with_cwd_config_file()
        } else {
            for path in &self.config_path {
                if path.display().to_string() == "/dev/null" {
                    break;
                }

                config = config.toml_file(path);
            }

            config
        };

        if let Some(profile) = &self.config_profile {
            config = config.profile(profile.to_string());
        }

        // Environment variables override config files.
        config = config.with_env_prefix();

        config
    }
}

pub fn main_impl() -> Result<(), ResignError> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    let mut config_builder = cli.config_builder();

    let command = cli.command.as_cli_command();

    if let Some(config) = command.as_config()? {
        config_builder = config_builder.with_config_struct(config);
    }

    let config = config_builder.config()?;

    let context = Context {
        config,
        verbose: cli.verbose,
    };

    command.run(&context)
}

#[cfg(test)]
mod test {
    use {super::*, clap::CommandFactory};

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn resign_args_to_config() {
        let cli = Cli::parse_from([
            "ipa-resign",
            "resign",
            "-s",
            "IDENTITY",
            "-p",
            "app.mobileprovision",
            "--strict-entitlements",
            "-b",
            "com.new.app",
            "Payload/Main.app",
        ]);

        let config = cli.command.as_cli_command().as_config().unwrap().unwrap();
        assert_eq!(
            config.resign,
            ResignConfig {
                sign_identity: Some("IDENTITY".into()),
                profile: Some("app.mobileprovision".into()),
                entitlements: None,
                main_app_name: None,
                strict_entitlements: Some(true),
            }
        );

        let cli = Cli::parse_from(["ipa-resign", "resign", "Main.app"]);
        let config = cli.command.as_cli_command().as_config().unwrap().unwrap();
        assert_eq!(config.resign, ResignConfig::default());
    }

    #[test]
    fn global_options() {
        let cli = Cli::parse_from([
            "ipa-resign",
            "inspect",
            "-vv",
            "-C",
            "/dev/null",
            "-P",
            "release",
            "Main.app",
        ]);

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config_path, vec![PathBuf::from("/dev/null")]);
        assert_eq!(cli.config_profile.as_deref(), Some("release"));
        assert!(cli.command.as_cli_command().as_config().unwrap().is_none());
    }

    #[test]
    fn config_file_and_profile() -> Result<(), ResignError> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("ipa-resign.toml");
        std::fs::write(
            &path,
            r#"
            [default.resign]
            sign_identity = "development"
            main_app_name = "Main"

            [release.resign]
            sign_identity = "distribution"
            "#,
        )?;
        let path = path.display().to_string();

        let cli = Cli::parse_from(["ipa-resign", "inspect", "-C", &path, "Main.app"]);
        let config = cli.config_builder().config()?;
        assert_eq!(config.resign.sign_identity.as_deref(), Some("development"));
        assert_eq!(config.resign.main_app_name.as_deref(), Some("Main"));

        let cli = Cli::parse_from([
            "ipa-resign",
            "resign",
            "-C",
            &path,
            "-P",
            "release",
            "--main-app-name",
            "Other",
            "Main.app",
        ]);
        let mut builder = cli.config_builder();
        if let Some(c) = cli.command.as_cli_command().as_config()? {
            builder = builder.with_config_struct(c);
        }
        let config = builder.config()?;
        assert_eq!(config.resign.sign_identity.as_deref(), Some("distribution"));
        assert_eq!(config.resign.main_app_name.as_deref(), Some("Other"));

        // An explicit /dev/null stops loading of any file.
        let cli = Cli::parse_from(["ipa-resign", "inspect", "-C", "/dev/null", "-C", &path, "x"]);
        assert_eq!(cli.config_builder().config()?, Config::default());

        Ok(())
    }
}
