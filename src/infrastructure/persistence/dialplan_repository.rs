//! SQLite repositories for the routable dialplan entities: inbound
//! numbers, ring groups, IVR menus, time switches, conference bridges and
//! audio prompts.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::conference::{ConferenceBridge, ConferenceBridgeRepository};
use crate::domain::inbound_number::{InboundNumber, InboundNumberRepository};
use crate::domain::ivr_menu::{IvrMenu, IvrMenuRepository};
use crate::domain::prompt::{AudioPrompt, AudioPromptRepository, PromptKind};
use crate::domain::ring_group::{RingGroup, RingGroupRepository, RingStrategy};
use crate::domain::time_switch::{TimeRule, TimeSwitch, TimeSwitchRepository};
use crate::{DomainError, Result};

// --- inbound numbers ---

pub struct SqliteInboundNumberRepository {
    pool: SqlitePool,
}

impl SqliteInboundNumberRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_did(row: &SqliteRow) -> Result<InboundNumber> {
    Ok(InboundNumber {
        id: row.try_get("id")?,
        number: row.try_get("number")?,
        label: row.try_get("label")?,
        trunk_id: row.try_get("trunk_id")?,
        flow_id: row.try_get("flow_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait::async_trait]
impl InboundNumberRepository for SqliteInboundNumberRepository {
    async fn create(&self, did: &InboundNumber) -> Result<InboundNumber> {
        let result = sqlx::query(
            "INSERT INTO inbound_numbers (number, label, trunk_id, flow_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&did.number)
        .bind(&did.label)
        .bind(did.trunk_id)
        .bind(did.flow_id)
        .bind(did.created_at)
        .bind(did.updated_at)
        .execute(&self.pool)
        .await?;
        let mut created = did.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn update(&self, did: &InboundNumber) -> Result<()> {
        sqlx::query(
            "UPDATE inbound_numbers SET number = ?, label = ?, trunk_id = ?, flow_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&did.number)
        .bind(&did.label)
        .bind(did.trunk_id)
        .bind(did.flow_id)
        .bind(Utc::now())
        .bind(did.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM inbound_numbers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<InboundNumber>> {
        let row = sqlx::query("SELECT * FROM inbound_numbers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_did).transpose()
    }

    async fn match_number(
        &self,
        number: &str,
        trunk_id: Option<i64>,
    ) -> Result<Option<InboundNumber>> {
        // a trunk-bound DID wins over an unbound one for the same number
        let row = sqlx::query(
            "SELECT * FROM inbound_numbers WHERE number = ? AND (trunk_id IS NULL OR trunk_id = ?) \
             ORDER BY trunk_id IS NULL LIMIT 1",
        )
        .bind(number)
        .bind(trunk_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_did).transpose()
    }

    async fn list(&self) -> Result<Vec<InboundNumber>> {
        let rows = sqlx::query("SELECT * FROM inbound_numbers ORDER BY number")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_did).collect()
    }
}

// --- ring groups ---

pub struct SqliteRingGroupRepository {
    pool: SqlitePool,
}

impl SqliteRingGroupRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_group(row: &SqliteRow) -> Result<RingGroup> {
    let extension_ids: Vec<i64> =
        serde_json::from_str(&row.try_get::<String, _>("extension_ids")?).unwrap_or_default();
    Ok(RingGroup {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        strategy: RingStrategy::from_str(&row.try_get::<String, _>("strategy")?)
            .unwrap_or(RingStrategy::RingAll),
        extension_ids,
        ring_timeout_secs: row.try_get::<i64, _>("ring_timeout_secs")? as u32,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait::async_trait]
impl RingGroupRepository for SqliteRingGroupRepository {
    async fn create(&self, group: &RingGroup) -> Result<RingGroup> {
        let members = serde_json::to_string(&group.extension_ids)
            .map_err(|e| DomainError::Internal(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO ring_groups (name, strategy, extension_ids, ring_timeout_secs, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&group.name)
        .bind(group.strategy.as_str())
        .bind(&members)
        .bind(group.ring_timeout_secs as i64)
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&self.pool)
        .await?;
        let mut created = group.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn update(&self, group: &RingGroup) -> Result<()> {
        let members = serde_json::to_string(&group.extension_ids)
            .map_err(|e| DomainError::Internal(e.to_string()))?;
        sqlx::query(
            "UPDATE ring_groups SET name = ?, strategy = ?, extension_ids = ?, ring_timeout_secs = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&group.name)
        .bind(group.strategy.as_str())
        .bind(&members)
        .bind(group.ring_timeout_secs as i64)
        .bind(Utc::now())
        .bind(group.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM ring_groups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<RingGroup>> {
        let row = sqlx::query("SELECT * FROM ring_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_group).transpose()
    }

    async fn list(&self) -> Result<Vec<RingGroup>> {
        let rows = sqlx::query("SELECT * FROM ring_groups ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_group).collect()
    }
}

// --- IVR menus ---

pub struct SqliteIvrMenuRepository {
    pool: SqlitePool,
}

impl SqliteIvrMenuRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_menu(row: &SqliteRow) -> Result<IvrMenu> {
    Ok(IvrMenu {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        greeting_prompt_id: row.try_get("greeting_prompt_id")?,
        input_timeout_secs: row.try_get::<i64, _>("input_timeout_secs")? as u32,
        inter_digit_timeout_secs: row.try_get::<i64, _>("inter_digit_timeout_secs")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait::async_trait]
impl IvrMenuRepository for SqliteIvrMenuRepository {
    async fn create(&self, menu: &IvrMenu) -> Result<IvrMenu> {
        let result = sqlx::query(
            "INSERT INTO ivr_menus (name, greeting_prompt_id, input_timeout_secs, inter_digit_timeout_secs, max_retries, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&menu.name)
        .bind(menu.greeting_prompt_id)
        .bind(menu.input_timeout_secs as i64)
        .bind(menu.inter_digit_timeout_secs as i64)
        .bind(menu.max_retries as i64)
        .bind(menu.created_at)
        .bind(menu.updated_at)
        .execute(&self.pool)
        .await?;
        let mut created = menu.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn update(&self, menu: &IvrMenu) -> Result<()> {
        sqlx::query(
            "UPDATE ivr_menus SET name = ?, greeting_prompt_id = ?, input_timeout_secs = ?, inter_digit_timeout_secs = ?, max_retries = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&menu.name)
        .bind(menu.greeting_prompt_id)
        .bind(menu.input_timeout_secs as i64)
        .bind(menu.inter_digit_timeout_secs as i64)
        .bind(menu.max_retries as i64)
        .bind(Utc::now())
        .bind(menu.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM ivr_menus WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<IvrMenu>> {
        let row = sqlx::query("SELECT * FROM ivr_menus WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_menu).transpose()
    }

    async fn list(&self) -> Result<Vec<IvrMenu>> {
        let rows = sqlx::query("SELECT * FROM ivr_menus ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_menu).collect()
    }
}

// --- time switches ---

pub struct SqliteTimeSwitchRepository {
    pool: SqlitePool,
}

impl SqliteTimeSwitchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_switch(row: &SqliteRow) -> Result<TimeSwitch> {
    let rules: Vec<TimeRule> =
        serde_json::from_str(&row.try_get::<String, _>("rules")?).unwrap_or_default();
    Ok(TimeSwitch {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        rules,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait::async_trait]
impl TimeSwitchRepository for SqliteTimeSwitchRepository {
    async fn create(&self, switch: &TimeSwitch) -> Result<TimeSwitch> {
        let rules = serde_json::to_string(&switch.rules)
            .map_err(|e| DomainError::Internal(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO time_switches (name, rules, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&switch.name)
        .bind(&rules)
        .bind(switch.created_at)
        .bind(switch.updated_at)
        .execute(&self.pool)
        .await?;
        let mut created = switch.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn update(&self, switch: &TimeSwitch) -> Result<()> {
        let rules = serde_json::to_string(&switch.rules)
            .map_err(|e| DomainError::Internal(e.to_string()))?;
        sqlx::query("UPDATE time_switches SET name = ?, rules = ?, updated_at = ? WHERE id = ?")
            .bind(&switch.name)
            .bind(&rules)
            .bind(Utc::now())
            .bind(switch.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM time_switches WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<TimeSwitch>> {
        let row = sqlx::query("SELECT * FROM time_switches WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_switch).transpose()
    }

    async fn list(&self) -> Result<Vec<TimeSwitch>> {
        let rows = sqlx::query("SELECT * FROM time_switches ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_switch).collect()
    }
}

// --- conference bridges ---

pub struct SqliteConferenceBridgeRepository {
    pool: SqlitePool,
}

impl SqliteConferenceBridgeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_bridge(row: &SqliteRow) -> Result<ConferenceBridge> {
    Ok(ConferenceBridge {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        pin: row.try_get("pin")?,
        max_members: row.try_get::<i64, _>("max_members")? as u32,
        mute_on_join: row.try_get::<i64, _>("mute_on_join")? != 0,
        announce_joins: row.try_get::<i64, _>("announce_joins")? != 0,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait::async_trait]
impl ConferenceBridgeRepository for SqliteConferenceBridgeRepository {
    async fn create(&self, bridge: &ConferenceBridge) -> Result<ConferenceBridge> {
        let result = sqlx::query(
            "INSERT INTO conference_bridges (name, pin, max_members, mute_on_join, announce_joins, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&bridge.name)
        .bind(&bridge.pin)
        .bind(bridge.max_members as i64)
        .bind(bridge.mute_on_join as i64)
        .bind(bridge.announce_joins as i64)
        .bind(bridge.created_at)
        .bind(bridge.updated_at)
        .execute(&self.pool)
        .await?;
        let mut created = bridge.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn update(&self, bridge: &ConferenceBridge) -> Result<()> {
        sqlx::query(
            "UPDATE conference_bridges SET name = ?, pin = ?, max_members = ?, mute_on_join = ?, announce_joins = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&bridge.name)
        .bind(&bridge.pin)
        .bind(bridge.max_members as i64)
        .bind(bridge.mute_on_join as i64)
        .bind(bridge.announce_joins as i64)
        .bind(Utc::now())
        .bind(bridge.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM conference_bridges WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<ConferenceBridge>> {
        let row = sqlx::query("SELECT * FROM conference_bridges WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_bridge).transpose()
    }

    async fn list(&self) -> Result<Vec<ConferenceBridge>> {
        let rows = sqlx::query("SELECT * FROM conference_bridges ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_bridge).collect()
    }
}

// --- audio prompts ---

pub struct SqlitePromptRepository {
    pool: SqlitePool,
}

impl SqlitePromptRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_prompt(row: &SqliteRow) -> Result<AudioPrompt> {
    Ok(AudioPrompt {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: PromptKind::from_str(&row.try_get::<String, _>("kind")?)
            .unwrap_or(PromptKind::Custom),
        file_name: row.try_get("file_name")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait::async_trait]
impl AudioPromptRepository for SqlitePromptRepository {
    async fn create(&self, prompt: &AudioPrompt) -> Result<AudioPrompt> {
        let result = sqlx::query(
            "INSERT INTO audio_prompts (name, kind, file_name, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&prompt.name)
        .bind(prompt.kind.as_str())
        .bind(&prompt.file_name)
        .bind(prompt.created_at)
        .bind(prompt.updated_at)
        .execute(&self.pool)
        .await?;
        let mut created = prompt.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM audio_prompts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<AudioPrompt>> {
        let row = sqlx::query("SELECT * FROM audio_prompts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_prompt).transpose()
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<AudioPrompt>> {
        let row = sqlx::query("SELECT * FROM audio_prompts WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_prompt).transpose()
    }

    async fn list(&self) -> Result<Vec<AudioPrompt>> {
        let rows = sqlx::query("SELECT * FROM audio_prompts ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_prompt).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::database::test_pool;

    fn did(number: &str, trunk_id: Option<i64>, flow_id: i64) -> InboundNumber {
        InboundNumber {
            id: 0,
            number: number.into(),
            label: String::new(),
            trunk_id,
            flow_id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_did_exact_match_and_trunk_precedence() {
        let pool = test_pool().await;
        let repo = SqliteInboundNumberRepository::new(pool);

        repo.create(&did("5551000", None, 1)).await.unwrap();
        repo.create(&did("5551000", Some(7), 2)).await.unwrap();

        // a call from trunk 7 hits the trunk-bound entry
        let matched = repo.match_number("5551000", Some(7)).await.unwrap().unwrap();
        assert_eq!(matched.flow_id, 2);
        // other trunks fall back to the unbound entry
        let matched = repo.match_number("5551000", Some(9)).await.unwrap().unwrap();
        assert_eq!(matched.flow_id, 1);
        // exact string matching only
        assert!(repo.match_number("555100", None).await.unwrap().is_none());
        assert!(repo.match_number("55510000", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ring_group_members_roundtrip() {
        let pool = test_pool().await;
        let repo = SqliteRingGroupRepository::new(pool);

        let group = RingGroup {
            id: 0,
            name: "support".into(),
            strategy: RingStrategy::LongestIdle,
            extension_ids: vec![201, 202, 203],
            ring_timeout_secs: 20,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let created = repo.create(&group).await.unwrap();
        let fetched = repo.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.strategy, RingStrategy::LongestIdle);
        assert_eq!(fetched.extension_ids, vec![201, 202, 203]);
    }

    #[tokio::test]
    async fn test_time_switch_rules_roundtrip() {
        let pool = test_pool().await;
        let repo = SqliteTimeSwitchRepository::new(pool);

        let switch = TimeSwitch {
            id: 0,
            name: "hours".into(),
            rules: vec![TimeRule {
                id: "bh".into(),
                label: "Business".into(),
                days: vec![0, 1, 2, 3, 4],
                start: "09:00".into(),
                end: "17:00".into(),
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let created = repo.create(&switch).await.unwrap();
        let fetched = repo.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.rules.len(), 1);
        assert_eq!(fetched.rules[0].id, "bh");
    }

    #[tokio::test]
    async fn test_conference_and_prompt_crud() {
        let pool = test_pool().await;
        let bridges = SqliteConferenceBridgeRepository::new(pool.clone());
        let prompts = SqlitePromptRepository::new(pool);

        let bridge = ConferenceBridge {
            id: 0,
            name: "standup".into(),
            pin: Some("1234".into()),
            max_members: 10,
            mute_on_join: true,
            announce_joins: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let created = bridges.create(&bridge).await.unwrap();
        let fetched = bridges.get(created.id).await.unwrap().unwrap();
        assert!(fetched.requires_pin());
        assert!(fetched.mute_on_join);

        let prompt = AudioPrompt {
            id: 0,
            name: "welcome".into(),
            kind: PromptKind::Custom,
            file_name: "welcome.wav".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let created = prompts.create(&prompt).await.unwrap();
        let by_name = prompts.get_by_name("welcome").await.unwrap().unwrap();
        assert_eq!(by_name.id, created.id);
        assert_eq!(by_name.kind, PromptKind::Custom);
    }
}
