// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use runa_model::ModelError;
use runa_store::StoreError;

use crate::hooks::HookError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Hook(#[from] HookError),
}
