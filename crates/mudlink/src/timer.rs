//! 定時器
//!
//! `TimerQueue` 只負責排程，不自己睡眠；擁有者（工作階段或排程器）在自己的
//! 事件迴圈中等待 `next_deadline()`，時間到時以 `take_due()` 取出並執行回呼。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// 定時器回呼，`C` 為擁有者提供的執行環境
pub trait TimerCallback<C>: Send + Sync {
    fn fire(&self, id: &str, context: &mut C);
}

impl<C, F> TimerCallback<C> for F
where
    F: Fn(&str, &mut C) + Send + Sync,
{
    fn fire(&self, id: &str, context: &mut C) {
        self(id, context)
    }
}

/// 定時器狀態摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerInfo {
    pub id: String,
    pub period: Duration,
    pub repeat: bool,
    pub enabled: bool,
    /// 距離下次觸發的時間
    pub remaining: Duration,
}

impl fmt::Display for TimerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Timer> id = '{}' period = {:.1}s {} enabled = {} remaining = {:.1}s",
            self.id,
            self.period.as_secs_f64(),
            if self.repeat { "repeat" } else { "oneshot" },
            self.enabled,
            self.remaining.as_secs_f64()
        )
    }
}

struct Timer<C> {
    period: Duration,
    repeat: bool,
    enabled: bool,
    next_fire: Instant,
    callback: Arc<dyn TimerCallback<C>>,
}

/// 到期的定時器，由擁有者呼叫 `fire` 執行
pub struct DueTimer<C> {
    pub id: String,
    callback: Arc<dyn TimerCallback<C>>,
}

impl<C> DueTimer<C> {
    pub fn fire(&self, context: &mut C) {
        self.callback.fire(&self.id, context);
    }
}

/// 定時器佇列
pub struct TimerQueue<C> {
    timers: BTreeMap<String, Timer<C>>,
    next_uid: u64,
}

impl<C> TimerQueue<C> {
    pub fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
            next_uid: 0,
        }
    }

    /// 新增定時器，返回 `ti<n>` 形式的 id
    pub fn add(&mut self, period: Duration, repeat: bool, callback: Arc<dyn TimerCallback<C>>) -> String {
        let id = loop {
            self.next_uid += 1;
            let id = format!("ti{}", self.next_uid);
            if !self.timers.contains_key(&id) {
                break id;
            }
        };
        self.insert(id.clone(), period, repeat, callback);
        id
    }

    /// 以指定 id 新增，已存在時取代
    pub fn insert(&mut self, id: String, period: Duration, repeat: bool, callback: Arc<dyn TimerCallback<C>>) {
        self.timers.insert(
            id,
            Timer {
                period,
                repeat,
                enabled: true,
                next_fire: Instant::now() + period,
                callback,
            },
        );
    }

    pub fn cancel(&mut self, id: &str) -> bool {
        self.timers.remove(id).is_some()
    }

    /// 從現在起重新計時
    pub fn restart(&mut self, id: &str) -> bool {
        match self.timers.get_mut(id) {
            Some(timer) => {
                timer.next_fire = Instant::now() + timer.period;
                true
            }
            None => false,
        }
    }

    /// 啟用時重新計時
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.timers.get_mut(id) {
            Some(timer) => {
                if enabled && !timer.enabled {
                    timer.next_fire = Instant::now() + timer.period;
                }
                timer.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.timers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    /// 最早的觸發時間
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .values()
            .filter(|t| t.enabled)
            .map(|t| t.next_fire)
            .min()
    }

    /// 取出所有到期的定時器
    ///
    /// 重複定時器以觸發時刻為基準排下一次，落後太多時從 `now` 重新起算；
    /// 一次性定時器直接移除。
    pub fn take_due(&mut self, now: Instant) -> Vec<DueTimer<C>> {
        let mut due = Vec::new();
        let mut finished = Vec::new();
        for (id, timer) in self.timers.iter_mut() {
            if !timer.enabled || timer.next_fire > now {
                continue;
            }
            due.push(DueTimer {
                id: id.clone(),
                callback: Arc::clone(&timer.callback),
            });
            if timer.repeat {
                timer.next_fire += timer.period;
                if timer.next_fire <= now {
                    timer.next_fire = now + timer.period;
                }
            } else {
                finished.push(id.clone());
            }
        }
        for id in finished {
            self.timers.remove(&id);
        }
        due
    }

    pub fn list(&self) -> Vec<TimerInfo> {
        let now = Instant::now();
        self.timers
            .iter()
            .map(|(id, t)| TimerInfo {
                id: id.clone(),
                period: t.period,
                repeat: t.repeat,
                enabled: t.enabled,
                remaining: t.next_fire.saturating_duration_since(now),
            })
            .collect()
    }
}

impl<C> Default for TimerQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for TimerQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("timers", &self.timers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> Arc<dyn TimerCallback<Vec<String>>> {
        Arc::new(|id: &str, log: &mut Vec<String>| log.push(id.to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let mut queue = TimerQueue::new();
        let id = queue.add(Duration::from_secs(1), false, counter());
        assert_eq!(id, "ti1");
        assert!(queue.take_due(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let mut log = Vec::new();
        for timer in queue.take_due(Instant::now()) {
            timer.fire(&mut log);
        }
        assert_eq!(log, vec!["ti1"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_reschedules() {
        let mut queue = TimerQueue::new();
        queue.add(Duration::from_millis(100), true, counter());
        let start = Instant::now();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(queue.take_due(Instant::now()).len(), 1);
        assert_eq!(queue.next_deadline(), Some(start + Duration::from_millis(200)));

        // 落後多個週期時只觸發一次
        tokio::time::advance(Duration::from_millis(550)).await;
        assert_eq!(queue.take_due(Instant::now()).len(), 1);
        assert_eq!(queue.next_deadline(), Some(Instant::now() + Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_timer_has_no_deadline() {
        let mut queue: TimerQueue<Vec<String>> = TimerQueue::new();
        let id = queue.add(Duration::from_secs(5), true, counter());
        assert!(queue.set_enabled(&id, false));
        assert_eq!(queue.next_deadline(), None);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(queue.take_due(Instant::now()).is_empty());
        queue.set_enabled(&id, true);
        assert_eq!(queue.next_deadline(), Some(Instant::now() + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_and_cancel() {
        let mut queue: TimerQueue<Vec<String>> = TimerQueue::new();
        let id = queue.add(Duration::from_secs(2), false, counter());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(queue.restart(&id));
        assert_eq!(queue.list()[0].remaining, Duration::from_secs(2));
        assert!(queue.cancel(&id));
        assert!(!queue.cancel(&id));
    }
}
