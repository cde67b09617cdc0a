//! Scenario tests across the controller, the manager and the translations.
