//! 元素描述符：页面元素的静态定位数据
//!
//! 供应商页面布局相关的选择器都以这种数据形式存在，编排器本身不认识任何具体页面。
//! 一个描述符带若干候选定位方式，驱动按顺序尝试，第一个命中者生效。

use std::fmt;

/// 单个定位方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locator {
    /// CSS 选择器
    Css(&'static str),
    /// XPath 表达式
    XPath(&'static str),
    /// 包含给定可见文本的元素
    Text(&'static str),
    /// JSON 响应中的路径（HTTP 驱动）：`/a/0/b`，`[field=value]` 段按字段匹配数组元素
    JsonPointer(&'static str),
    /// 当前页面地址本身（属性名忽略，返回 URL）
    Location,
}

/// 元素描述符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementDescriptor {
    /// 可读名称，用于日志与测试脚本
    pub name: &'static str,
    pub locators: &'static [Locator],
}

impl ElementDescriptor {
    pub const fn new(name: &'static str, locators: &'static [Locator]) -> Self {
        Self { name, locators }
    }
}

impl fmt::Display for ElementDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// 页面正文，导航后的异常检查等待它出现
pub const BODY: ElementDescriptor = ElementDescriptor::new("body", &[Locator::Css("body")]);

/// 当前页面地址
pub const PAGE_LOCATION: ElementDescriptor =
    ElementDescriptor::new("page location", &[Locator::Location]);
