//! Integration tests for the runtime core live under `tests/`.
