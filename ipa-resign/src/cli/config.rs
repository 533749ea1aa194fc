// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::error::ResignError,
    figment::{
        providers::{Env, Format, Serialized, Toml},
        Figment,
    },
    log::debug,
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
};

/// Name of configuration files.
pub const CONFIG_FILE_NAME: &str = "ipa-resign.toml";

/// Prefix of environment variables holding configuration.
pub const ENV_PREFIX: &str = "IPA_RESIGN_";

/// Configuration file profile definition.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Configuration for the resign command.
    #[serde(default)]
    pub resign: ResignConfig,
}

/// Configuration for the resign command.
///
/// Unset values don't override values from lower priority sources.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResignConfig {
    /// Code signing identity passed to `codesign`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_identity: Option<String>,

    /// Provisioning profile to embed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<PathBuf>,

    /// Entitlements plist applied to every bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<PathBuf>,

    /// Main application to pick when `Payload/` has several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_app_name: Option<String>,

    /// Require an application identifier in entitlements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict_entitlements: Option<bool>,
}

/// Used to instantiate [Config] instances.
#[derive(Clone)]
pub struct ConfigBuilder {
    loader: Figment,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            loader: Figment::new(),
        }
    }
}

impl ConfigBuilder {
    /// Add the $XDG_CONFIG/ipa-resign/ipa-resign.toml user config file if it exists.
    pub fn with_user_config_file(mut self) -> Self {
        if let Some(base) = dirs::config_dir() {
            let p = base.join("ipa-resign").join(CONFIG_FILE_NAME);
            debug!("registering user config file: {}", p.display());

            self.loader = self.loader.merge(Toml::file(p).nested());
        }

        self
    }

    /// Merge a config file from `pwd`/ipa-resign.toml.
    pub fn with_cwd_config_file(mut self) -> Self {
        if let Ok(cwd) = std::env::current_dir() {
            let p = cwd.join(CONFIG_FILE_NAME);
            debug!("registering cwd config file: {}", p.display());

            self.loader = self.loader.merge(Toml::file(p).nested());
        }

        self
    }

    /// Merge with environment variables.
    ///
    /// Nested keys are separated by `__`, e.g.
    /// `IPA_RESIGN_RESIGN__SIGN_IDENTITY`.
    ///
    /// Must be called after [Self::profile()] to ensure environment variables
    /// are mapped to the current profile.
    pub fn with_env_prefix(mut self) -> Self {
        debug!("registering {} environment variable config source", ENV_PREFIX);
        let env = Env::prefixed(ENV_PREFIX)
            .split("__")
            .profile(self.loader.profile().to_string());

        self.loader = self.loader.merge(env);
        self
    }

    /// Add a TOML config file to this instance.
    pub fn toml_file(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        debug!("registering custom config file: {}", path.display());
        self.loader = self.loader.merge(Toml::file(path).nested());
        self
    }

    /// Merge a [Config] struct into this builder
    pub fn with_config_struct(mut self, config: Config) -> Self {
        debug!("registering config struct");
        let serialized = Serialized::defaults(config).profile(self.loader.profile().to_string());

        self.loader = self.loader.merge(serialized);
        self
    }

    /// Load the named profile instead of the `[default]` profile.
    pub fn profile(mut self, profile: String) -> Self {
        self.loader = self.loader.select(profile);
        self
    }

    /// Obtain a config profile.
    pub fn config(self) -> Result<Config, ResignError> {
        Ok(self.loader.extract()?)
    }
}

#[cfg(test)]
mod test {
    use {super::*, std::io::Write, tempfile::NamedTempFile};

    fn toml_config(data: &str) -> (NamedTempFile, ConfigBuilder) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data.as_bytes()).unwrap();

        let builder = ConfigBuilder::default().toml_file(file.path());

        (file, builder)
    }

    #[test]
    fn default_config() {
        let c = ConfigBuilder::default().config().unwrap();

        assert_eq!(c, Config::default());
    }

    #[test]
    fn resign_values() {
        let (_file, builder) = toml_config(
            r#"
            [default.resign]
            sign_identity = "Apple Distribution: Example (ABCDE12345)"
            profile = "app.mobileprovision"
            entitlements = "entitlements.plist"
            main_app_name = "Main"
            strict_entitlements = true
            "#,
        );
        let c = builder.config().unwrap();

        assert_eq!(
            c.resign,
            ResignConfig {
                sign_identity: Some("Apple Distribution: Example (ABCDE12345)".into()),
                profile: Some(PathBuf::from("app.mobileprovision")),
                entitlements: Some(PathBuf::from("entitlements.plist")),
                main_app_name: Some("Main".into()),
                strict_entitlements: Some(true),
            }
        );
    }

    #[test]
    fn profile_selection() {
        let data = r#"
            [default.resign]
            sign_identity = "development"

            [release.resign]
            sign_identity = "distribution"
            "#;

        let (_file, builder) = toml_config(data);

        assert_eq!(
            builder
                .clone()
                .config()
                .unwrap()
                .resign
                .sign_identity
                .as_deref(),
            Some("development")
        );
        assert_eq!(
            builder
                .profile("release".into())
                .config()
                .unwrap()
                .resign
                .sign_identity
                .as_deref(),
            Some("distribution")
        );
    }

    #[test]
    fn struct_overrides_only_set_values() {
        let (_file, builder) = toml_config(
            r#"
            [default.resign]
            sign_identity = "from-file"
            profile = "file.mobileprovision"
            "#,
        );
        let c = builder
            .with_config_struct(Config {
                resign: ResignConfig {
                    sign_identity: Some("from-cli".into()),
                    ..Default::default()
                },
            })
            .config()
            .unwrap();

        assert_eq!(c.resign.sign_identity.as_deref(), Some("from-cli"));
        assert_eq!(
            c.resign.profile,
            Some(PathBuf::from("file.mobileprovision"))
        );
    }

    #[test]
    fn unknown_key_rejected() {
        let (_file, builder) = toml_config(
            r#"
            [default.resign]
            bogus = 1
            "#,
        );
        assert!(builder.config().is_err());
    }
}
