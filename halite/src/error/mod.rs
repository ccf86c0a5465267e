/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

mod ann_error;

pub use ann_error::{AnnError, AnnErrorKind, AnnResult, IntoAnnResult};
