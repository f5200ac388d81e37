// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared building blocks for the windlass cluster bring-up workspace.

pub mod log;
pub mod poll;
pub mod retry;
