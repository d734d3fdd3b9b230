/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The two halves of the sync pipeline. Both are split-phase: the database
//! work happens in short transactions under the store's gate, the network
//! round-trip happens with the gate released.

pub(crate) mod download;
pub(crate) mod upload;

pub use upload::UploadSummary;
