// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod schema;

pub use loader::{load_config, load_config_from, ConfigError};
pub use schema::{
    Config, EngineConfig, HooksConfig, ProviderConfig, SessionConfig, SkillsConfig,
    StorageConfig, ToolProtocolConfig, ToolServerSpec,
};
