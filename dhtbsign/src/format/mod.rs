/*
 * SPDX-FileCopyrightText: 2024-2025 dhtbsign developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod bootimage;
pub mod dhtb;
pub mod padding;
pub mod vbmeta;
