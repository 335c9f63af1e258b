//! 任务描述与状态键推导
//!
//! 把 (爬虫名称, URL) 映射为确定的 [`StatusKey`]：
//! - 列表页：`page` 查询参数作为标识
//! - 详情页：路径 `book/<id>.html` 中的书籍 ID
//! - 评论页：`tid` + `page` 组合为 `<book_id>_<page>`，缺省页码为 1
//!
//! 查询参数顺序、多余的斜杠、数字前导零都不影响推导结果；
//! 无法识别的 URL 推导结果为 `None`，调用方必须按"总是执行"处理

use url::Url;

use super::types::StatusKey;

/// 爬虫种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpiderKind {
    NovelList,
    NovelDetail,
    NovelComment,
}

impl SpiderKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "novel_list" => Some(Self::NovelList),
            "novel_detail" => Some(Self::NovelDetail),
            "novel_comment" => Some(Self::NovelComment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NovelList => "novel_list",
            Self::NovelDetail => "novel_detail",
            Self::NovelComment => "novel_comment",
        }
    }

    /// 该爬虫写入台账时使用的状态类型
    pub fn status_type(&self) -> &'static str {
        match self {
            Self::NovelList => "list_page",
            Self::NovelDetail => "detail_page",
            Self::NovelComment => "comment_page",
        }
    }

    pub fn all() -> [SpiderKind; 3] {
        [Self::NovelList, Self::NovelDetail, Self::NovelComment]
    }
}

impl std::fmt::Display for SpiderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个爬取任务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrawlTask {
    /// 列表页
    ListPage { page: u64 },
    /// 小说详情页
    DetailPage { book_id: u64 },
    /// 评论分页
    CommentPage { book_id: u64, page: u64 },
}

impl CrawlTask {
    pub fn spider(&self) -> SpiderKind {
        match self {
            Self::ListPage { .. } => SpiderKind::NovelList,
            Self::DetailPage { .. } => SpiderKind::NovelDetail,
            Self::CommentPage { .. } => SpiderKind::NovelComment,
        }
    }

    pub fn identifier(&self) -> String {
        match self {
            Self::ListPage { page } => page.to_string(),
            Self::DetailPage { book_id } => book_id.to_string(),
            Self::CommentPage { book_id, page } => format!("{}_{}", book_id, page),
        }
    }

    pub fn status_key(&self) -> StatusKey {
        let spider = self.spider();
        StatusKey::new(spider.as_str(), spider.status_type(), self.identifier())
    }

    /// 按爬虫种类的规则从 URL 推导任务
    pub fn from_url(spider: SpiderKind, url: &Url) -> Option<Self> {
        let segments: Vec<&str> = url
            .path_segments()?
            .filter(|segment| !segment.is_empty())
            .collect();

        match spider {
            SpiderKind::NovelList => {
                if !segments.contains(&"cat") {
                    return None;
                }
                let page = parse_number(&query_param(url, "page")?)?;
                Some(Self::ListPage { page })
            }
            SpiderKind::NovelDetail => {
                let pos = segments.iter().position(|s| *s == "book")?;
                let raw = *segments.get(pos + 1)?;
                let raw = raw.strip_suffix(".html").unwrap_or(raw);
                let book_id = parse_number(raw)?;
                Some(Self::DetailPage { book_id })
            }
            SpiderKind::NovelComment => {
                if !segments.ends_with(&["comment", "items"]) {
                    return None;
                }
                let book_id = parse_number(&query_param(url, "tid")?)?;
                let page = match query_param(url, "page") {
                    Some(raw) => parse_number(&raw)?,
                    None => 1,
                };
                Some(Self::CommentPage { book_id, page })
            }
        }
    }
}

/// 从爬虫名称和 URL 推导任务
pub fn derive_task(spider_name: &str, url: &str) -> Option<CrawlTask> {
    let spider = SpiderKind::from_name(spider_name)?;
    let url = Url::parse(url).ok()?;
    CrawlTask::from_url(spider, &url)
}

/// 从爬虫名称和 URL 推导状态键
pub fn derive_key(spider_name: &str, url: &str) -> Option<StatusKey> {
    derive_task(spider_name, url).map(|task| task.status_key())
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// 只接受纯数字（不允许符号和空白）
fn parse_number(raw: &str) -> Option<u64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_list_page_key() {
        let key = derive_key("novel_list", "https://www.linovel.net/cat/-1.html?page=7").unwrap();
        assert_eq!(key, StatusKey::new("novel_list", "list_page", "7"));

        // 参数顺序、前导零无关
        let key2 =
            derive_key("novel_list", "https://www.linovel.net/cat/-1.html?sort=new&page=007")
                .unwrap();
        assert_eq!(key, key2);
    }

    #[test]
    fn test_detail_page_key() {
        let expected = StatusKey::new("novel_detail", "detail_page", "100818");
        for url in [
            "https://www.linovel.net/book/100818.html",
            "https://www.linovel.net/book/100818.html/",
            "https://www.linovel.net//book/100818.html?from=list",
            "https://www.linovel.net/book/100818/",
        ] {
            assert_eq!(derive_key("novel_detail", url), Some(expected.clone()), "{}", url);
        }
    }

    #[test]
    fn test_comment_page_key() {
        let key = derive_key(
            "novel_comment",
            "https://www.linovel.net/comment/items?type=book&tid=100007&page=3",
        )
        .unwrap();
        assert_eq!(key, StatusKey::new("novel_comment", "comment_page", "100007_3"));

        // 缺省页码为 1
        let key = derive_key("novel_comment", "https://www.linovel.net/comment/items?tid=100007")
            .unwrap();
        assert_eq!(key.identifier, "100007_1");
    }

    #[test]
    fn test_unrecognized_urls() {
        // 未知爬虫
        assert!(derive_key("novel_chapter", "https://www.linovel.net/book/1.html").is_none());
        // 爬虫与 URL 形状不匹配
        assert!(derive_key("novel_list", "https://www.linovel.net/book/1.html").is_none());
        assert!(derive_key("novel_detail", "https://www.linovel.net/cat/-1.html?page=2").is_none());
        // 缺少或非法参数
        assert!(derive_key("novel_list", "https://www.linovel.net/cat/-1.html").is_none());
        assert!(derive_key("novel_list", "https://www.linovel.net/cat/-1.html?page=abc").is_none());
        assert!(derive_key("novel_list", "https://www.linovel.net/cat/-1.html?page=-3").is_none());
        assert!(derive_key("novel_detail", "https://www.linovel.net/book/abc.html").is_none());
        assert!(derive_key("novel_comment", "https://www.linovel.net/comment/items?page=2").is_none());
        assert!(
            derive_key("novel_comment", "https://www.linovel.net/comment/items?tid=1&page=x")
                .is_none()
        );
        // 不是合法 URL
        assert!(derive_key("novel_detail", "not a url").is_none());
    }

    #[test]
    fn test_task_round_trip_through_key() {
        let task = CrawlTask::CommentPage { book_id: 42, page: 9 };
        assert_eq!(task.spider(), SpiderKind::NovelComment);
        assert_eq!(task.status_key().cache_key(), "crawl_status:novel_comment:comment_page:42_9");
    }

    proptest! {
        #[test]
        fn prop_query_order_does_not_change_key(
            tid in 1u64..10_000_000,
            page in 1u64..10_000,
            extra in "[a-z]{1,8}",
        ) {
            let forward = format!(
                "https://www.linovel.net/comment/items?tid={}&page={}&x={}",
                tid, page, extra
            );
            let reversed = format!(
                "https://www.linovel.net/comment/items/?x={}&page={}&tid={}",
                extra, page, tid
            );
            let a = derive_key("novel_comment", &forward);
            let b = derive_key("novel_comment", &reversed);
            prop_assert!(a.is_some());
            prop_assert_eq!(a, b);
        }
    }
}
