/*
 * This file is part of Fanbridge.
 *
 * Copyright (C) 2025 Fanbridge contributors
 *
 * Fanbridge is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Fanbridge is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Fanbridge. If not, see <https://www.gnu.org/licenses/>.
 */

//! Fanbridge - fan control for Macs
//!
//! The binary's process modes on top of the `fb-*` crates: the control loop,
//! one-shot snapshots and resets, service installation, and the broker
//! entry points.

pub mod app;
pub mod cli;
pub mod logger;
pub mod report;
