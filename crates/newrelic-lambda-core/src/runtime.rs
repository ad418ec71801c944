// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::JavaHandler;

/// Runtimes whose handler can be redirected to a New Relic wrapper
pub const WRAPPABLE_RUNTIMES: &[&str] = &[
    "nodejs16.x",
    "nodejs18.x",
    "nodejs20.x",
    "nodejs22.x",
    "python3.7",
    "python3.8",
    "python3.9",
    "python3.10",
    "python3.11",
    "python3.12",
    "python3.13",
    "java8.al2",
    "java11",
    "java17",
    "java21",
    "dotnet6",
    "dotnet7",
    "dotnet8",
];

pub const NODE_WRAPPER_HANDLER: &str = "newrelic-lambda-wrapper.handler";
pub const PYTHON_WRAPPER_HANDLER: &str = "newrelic_lambda_wrapper.handler";
pub const JAVA_WRAPPER_CLASS: &str = "com.newrelic.java.HandlerWrapper";

pub const ARCH_X86_64: &str = "x86_64";
pub const ARCH_ARM64: &str = "arm64";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFamily {
    Node,
    Python,
    Java,
    Dotnet,
    Other,
}

impl RuntimeFamily {
    pub fn of(runtime: &str) -> Self {
        if runtime.starts_with("nodejs") {
            RuntimeFamily::Node
        } else if runtime.starts_with("python") {
            RuntimeFamily::Python
        } else if runtime.starts_with("java") {
            RuntimeFamily::Java
        } else if runtime.starts_with("dotnet") {
            RuntimeFamily::Dotnet
        } else {
            RuntimeFamily::Other
        }
    }
}

pub fn is_wrappable(runtime: &str) -> bool {
    WRAPPABLE_RUNTIMES.contains(&runtime)
}

/// Handler the function is redirected to. `None` means the handler is left alone,
/// as for .NET where the profiler attaches without a wrapper.
pub fn wrapper_handler(runtime: &str, java_handler: JavaHandler) -> Option<String> {
    match RuntimeFamily::of(runtime) {
        RuntimeFamily::Node => Some(NODE_WRAPPER_HANDLER.to_string()),
        RuntimeFamily::Python => Some(PYTHON_WRAPPER_HANDLER.to_string()),
        RuntimeFamily::Java => Some(format!("{JAVA_WRAPPER_CLASS}::{}", java_handler.method())),
        RuntimeFamily::Dotnet | RuntimeFamily::Other => None,
    }
}
