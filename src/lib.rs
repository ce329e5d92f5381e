pub mod agent_modules;
pub mod version;
