// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[
    clap(
        name = "relay-operator",
        version,
        author,
        about = "Operator federating custom resources between a management cluster and service clusters"
    )
]
pub struct CliArgs {
    /// Configuration file (JSON, YAML or TOML), applied before RELAY__* environment variables
    #[clap(short, long, env = "RELAY_CONFIG")]
    pub config: Option<String>,
    #[clap(subcommand)]
    pub cmd: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[
        clap(
            name = "crds",
            about = "Generate Custom Resource Definitions (CRDs) for the operator"
        )
    ]
    Crds,
    #[
        clap(
            name = "controller",
            about = "Run the controllers"
        )
    ]
    Controller,
    #[
        clap(
            name = "mirror",
            about = "Run a single mirror loop from the `mirror` configuration section"
        )
    ]
    Mirror,
    #[
        clap(
            name = "webhook",
            about = "Run the admission webhook server",
        )
    ]
    Webhook,
}
