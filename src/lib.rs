//! # Relay Harness
//!
//! The core of a chat-bot front-end: it relays user messages to an
//! LLM chat-completion service and publishes uploaded ZIP archives to
//! GitHub.
//!
//! Two pieces do the real work. The [`dispatcher`] spreads completion
//! calls over a pool of API keys and rotates past rate-limited ones. The
//! [`sync`] pipeline pushes an extracted archive into a repository, file
//! by file. Both hang off a memory-resident [`sessions`] store.
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────┐
//!  HTTP events ─▶│  Relay   │──── text ────▶ Dispatcher ──▶ completion API
//!                │          │                    │
//!                │          │◀── transcript ── Sessions ◀── Intake ◀── ZIP
//!                │          │                    │
//!                │          │── "upload" ──▶ Sync Pipeline ──▶ GitHub
//!                └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export GROQ_API_KEY=... TELEGRAM_BOT_TOKEN=... GITHUB_TOKEN=...
//! relay check                         # validate config and credentials
//! relay complete "hello"              # one-shot completion
//! relay push ./site --repo my-site    # sync a local directory
//! relay serve                         # start the HTTP event surface
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment credentials |
//! | [`models`] | Core data types |
//! | [`credentials`] | Round-robin API key pool |
//! | [`completion`] | Chat completion client |
//! | [`dispatcher`] | Key rotation and rate-limit retry |
//! | [`sessions`] | Per-user transcripts and pending archives |
//! | [`intake`] | ZIP validation and extraction |
//! | [`hosting`] | GitHub REST client |
//! | [`sync`] | Directory-to-repository synchronization |
//! | [`intent`] | Upload intent detection |
//! | [`relay`] | Event routing and user-facing replies |
//! | [`server`] | HTTP event surface |
//! | [`commands`] | CLI command implementations |
//! | [`logging`] | Tracing subscriber setup |

pub mod commands;
pub mod completion;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod hosting;
pub mod intake;
pub mod intent;
pub mod logging;
pub mod models;
pub mod relay;
pub mod server;
pub mod sessions;
pub mod sync;
