//! 宿主服务层模块
//!
//! 插件通过上下文访问的宿主服务门面，以及面向组织的模块管理

pub mod host;
pub mod http;
pub mod installations;
pub mod memory;
pub mod module_manager;

// 重新导出核心服务
pub use host::*;
pub use http::ReqwestHttpService;
pub use installations::*;
pub use memory::*;
pub use module_manager::*;
