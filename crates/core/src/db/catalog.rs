//! The configuration mirror: tenant, device models, registers, meters and
//! device-register associations, written only by the remote-to-local sync.
//!
//! Upserts are change-detecting (`IS DISTINCT FROM` guards on the `DO
//! UPDATE`), so a sync that changes nothing reports zero modifications and
//! triggers no cache reload. Rows absent from the remote are deactivated,
//! never deleted.

use async_trait::async_trait;
use deadpool_postgres::Pool;

use crate::error::DbError;
use crate::model::{Meter, PhaseResult, RegisterDef, Tenant};
use crate::remote::{RemoteDeviceRegister, RemoteMeter, RemoteRegister, RemoteTenant};

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn upsert_tenant(&self, tenant: &RemoteTenant) -> Result<PhaseResult, DbError>;

    async fn upsert_registers(&self, registers: &[RemoteRegister]) -> Result<PhaseResult, DbError>;

    async fn upsert_meters(&self, meters: &[RemoteMeter]) -> Result<PhaseResult, DbError>;

    async fn upsert_device_registers(
        &self,
        associations: &[RemoteDeviceRegister],
    ) -> Result<PhaseResult, DbError>;

    async fn tenant(&self) -> Result<Option<Tenant>, DbError>;

    async fn load_registers(&self) -> Result<Vec<RegisterDef>, DbError>;

    async fn load_meters(&self) -> Result<Vec<Meter>, DbError>;
}

pub struct PgCatalogStore {
    pool: Pool,
}

impl PgCatalogStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// Fold one change-detecting upsert outcome into a phase result.
/// `None` means the row existed and was identical.
fn tally(result: &mut PhaseResult, outcome: Option<bool>) {
    match outcome {
        Some(true) => result.inserted += 1,
        Some(false) => result.updated += 1,
        None => {}
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn upsert_tenant(&self, tenant: &RemoteTenant) -> Result<PhaseResult, DbError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(
                "INSERT INTO tenant (id, name, street, city, postal_code, country, active) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (id) DO UPDATE SET \
                     name = EXCLUDED.name, street = EXCLUDED.street, city = EXCLUDED.city, \
                     postal_code = EXCLUDED.postal_code, country = EXCLUDED.country, \
                     active = EXCLUDED.active, updated_at = now() \
                 WHERE (tenant.name, tenant.street, tenant.city, tenant.postal_code, \
                        tenant.country, tenant.active) IS DISTINCT FROM \
                       (EXCLUDED.name, EXCLUDED.street, EXCLUDED.city, EXCLUDED.postal_code, \
                        EXCLUDED.country, EXCLUDED.active) \
                 RETURNING (xmax = 0)",
                &[
                    &tenant.id,
                    &tenant.name,
                    &tenant.street,
                    &tenant.city,
                    &tenant.postal_code,
                    &tenant.country,
                    &tenant.active,
                ],
            )
            .await?;
        tx.commit().await?;

        let mut result = PhaseResult::default();
        tally(&mut result, row.map(|r| r.get(0)));
        Ok(result)
    }

    async fn upsert_registers(&self, registers: &[RemoteRegister]) -> Result<PhaseResult, DbError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let mut result = PhaseResult::default();

        // Mirror any embedded device models first; their counts are not part
        // of the register phase result.
        let mut seen_models = std::collections::HashSet::new();
        for register in registers {
            let Some(model) = &register.device_model else {
                continue;
            };
            if !seen_models.insert(model.id.as_str()) {
                continue;
            }
            tx.execute(
                "INSERT INTO device (id, manufacturer, model_number, device_type) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (id) DO UPDATE SET \
                     manufacturer = EXCLUDED.manufacturer, \
                     model_number = EXCLUDED.model_number, \
                     device_type = EXCLUDED.device_type",
                &[
                    &model.id,
                    &model.manufacturer,
                    &model.model_number,
                    &model.device_type,
                ],
            )
            .await?;
        }

        for register in registers {
            let object_type = register.bacnet_object_type as i32;
            let instance = register.bacnet_instance as i64;
            let property = register.property as i64;
            let row = tx
                .query_opt(
                    "INSERT INTO register \
                     (id, device_model_id, register_number, field_name, unit, data_type, \
                      bacnet_object_type, bacnet_instance, property, active) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE) \
                     ON CONFLICT (device_model_id, register_number) DO UPDATE SET \
                         id = EXCLUDED.id, field_name = EXCLUDED.field_name, \
                         unit = EXCLUDED.unit, data_type = EXCLUDED.data_type, \
                         bacnet_object_type = EXCLUDED.bacnet_object_type, \
                         bacnet_instance = EXCLUDED.bacnet_instance, \
                         property = EXCLUDED.property, active = TRUE \
                     WHERE (register.id, register.field_name, register.unit, \
                            register.data_type, register.bacnet_object_type, \
                            register.bacnet_instance, register.property, register.active) \
                           IS DISTINCT FROM \
                           (EXCLUDED.id, EXCLUDED.field_name, EXCLUDED.unit, \
                            EXCLUDED.data_type, EXCLUDED.bacnet_object_type, \
                            EXCLUDED.bacnet_instance, EXCLUDED.property, TRUE) \
                     RETURNING (xmax = 0)",
                    &[
                        &register.id,
                        &register.device_model_id,
                        &register.register_number,
                        &register.field_name,
                        &register.unit,
                        &register.data_type,
                        &object_type,
                        &instance,
                        &property,
                    ],
                )
                .await?;
            tally(&mut result, row.map(|r| r.get(0)));
        }

        let model_ids: Vec<&str> = registers.iter().map(|r| r.device_model_id.as_str()).collect();
        let register_numbers: Vec<i32> = registers.iter().map(|r| r.register_number).collect();
        let deactivated = tx
            .execute(
                "UPDATE register SET active = FALSE \
                 WHERE active AND NOT EXISTS ( \
                     SELECT 1 FROM unnest($1::text[], $2::int4[]) AS remote(model_id, number) \
                     WHERE remote.model_id = register.device_model_id \
                       AND remote.number = register.register_number \
                 )",
                &[&model_ids, &register_numbers],
            )
            .await?;
        result.deactivated = deactivated as usize;

        tx.commit().await?;
        Ok(result)
    }

    async fn upsert_meters(&self, meters: &[RemoteMeter]) -> Result<PhaseResult, DbError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let mut result = PhaseResult::default();

        let mut meter_ids: Vec<&str> = Vec::new();
        let mut element_ids: Vec<i32> = Vec::new();
        for meter in meters {
            for element in &meter.elements {
                let port = meter.port as i32;
                let row = tx
                    .query_opt(
                        "INSERT INTO meter \
                         (meter_id, meter_element_id, name, ip, port, active, \
                          device_model_id, tenant_id, location_id) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                         ON CONFLICT (meter_id, meter_element_id) DO UPDATE SET \
                             name = EXCLUDED.name, ip = EXCLUDED.ip, port = EXCLUDED.port, \
                             active = EXCLUDED.active, \
                             device_model_id = EXCLUDED.device_model_id, \
                             tenant_id = EXCLUDED.tenant_id, \
                             location_id = EXCLUDED.location_id \
                         WHERE (meter.name, meter.ip, meter.port, meter.active, \
                                meter.device_model_id, meter.tenant_id, meter.location_id) \
                               IS DISTINCT FROM \
                               (EXCLUDED.name, EXCLUDED.ip, EXCLUDED.port, EXCLUDED.active, \
                                EXCLUDED.device_model_id, EXCLUDED.tenant_id, \
                                EXCLUDED.location_id) \
                         RETURNING (xmax = 0)",
                        &[
                            &meter.meter_id,
                            &element.element_id,
                            &meter.name,
                            &meter.ip,
                            &port,
                            &meter.active,
                            &meter.device_model_id,
                            &meter.tenant_id,
                            &meter.location_id,
                        ],
                    )
                    .await?;
                tally(&mut result, row.map(|r| r.get(0)));
                meter_ids.push(meter.meter_id.as_str());
                element_ids.push(element.element_id);
            }
        }

        // Local rows whose composite key the remote no longer lists.
        let deactivated = tx
            .execute(
                "UPDATE meter SET active = FALSE \
                 WHERE active AND NOT EXISTS ( \
                     SELECT 1 FROM unnest($1::text[], $2::int4[]) AS remote(meter_id, element_id) \
                     WHERE remote.meter_id = meter.meter_id \
                       AND remote.element_id = meter.meter_element_id \
                 )",
                &[&meter_ids, &element_ids],
            )
            .await?;
        result.deactivated = deactivated as usize;

        tx.commit().await?;
        Ok(result)
    }

    async fn upsert_device_registers(
        &self,
        associations: &[RemoteDeviceRegister],
    ) -> Result<PhaseResult, DbError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let mut result = PhaseResult::default();

        for assoc in associations {
            let row = tx
                .query_opt(
                    "INSERT INTO device_register (device_model_id, register_id, active) \
                     VALUES ($1, $2, TRUE) \
                     ON CONFLICT (device_model_id, register_id) DO UPDATE SET active = TRUE \
                     WHERE NOT device_register.active \
                     RETURNING (xmax = 0)",
                    &[&assoc.device_model_id, &assoc.register_id],
                )
                .await?;
            tally(&mut result, row.map(|r| r.get(0)));
        }

        let model_ids: Vec<&str> = associations.iter().map(|a| a.device_model_id.as_str()).collect();
        let register_ids: Vec<&str> = associations.iter().map(|a| a.register_id.as_str()).collect();
        let deactivated = tx
            .execute(
                "UPDATE device_register SET active = FALSE \
                 WHERE active AND NOT EXISTS ( \
                     SELECT 1 FROM unnest($1::text[], $2::text[]) AS remote(model_id, register_id) \
                     WHERE remote.model_id = device_register.device_model_id \
                       AND remote.register_id = device_register.register_id \
                 )",
                &[&model_ids, &register_ids],
            )
            .await?;
        result.deactivated = deactivated as usize;

        tx.commit().await?;
        Ok(result)
    }

    async fn tenant(&self) -> Result<Option<Tenant>, DbError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, name, street, city, postal_code, country, active, \
                        created_at, updated_at \
                 FROM tenant ORDER BY created_at LIMIT 1",
                &[],
            )
            .await?;
        Ok(row.map(|row| Tenant {
            id: row.get("id"),
            name: row.get("name"),
            street: row.get("street"),
            city: row.get("city"),
            postal_code: row.get("postal_code"),
            country: row.get("country"),
            active: row.get("active"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn load_registers(&self) -> Result<Vec<RegisterDef>, DbError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, device_model_id, register_number, field_name, unit, data_type, \
                        bacnet_object_type, bacnet_instance, property, active \
                 FROM register ORDER BY device_model_id, register_number",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let object_type: i32 = row.get("bacnet_object_type");
                let instance: i64 = row.get("bacnet_instance");
                let property: i64 = row.get("property");
                Ok(RegisterDef {
                    id: row.get("id"),
                    device_model_id: row.get("device_model_id"),
                    register_number: row.get("register_number"),
                    field_name: row.get("field_name"),
                    unit: row.get("unit"),
                    data_type: row.get("data_type"),
                    object_type: u16::try_from(object_type)
                        .map_err(|_| DbError::Decode(format!("object type {object_type}")))?,
                    instance: u32::try_from(instance)
                        .map_err(|_| DbError::Decode(format!("instance {instance}")))?,
                    property: u32::try_from(property)
                        .map_err(|_| DbError::Decode(format!("property {property}")))?,
                    active: row.get("active"),
                })
            })
            .collect()
    }

    async fn load_meters(&self) -> Result<Vec<Meter>, DbError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT meter_id, meter_element_id, name, ip, port, active, \
                        device_model_id, tenant_id, location_id \
                 FROM meter ORDER BY meter_id, meter_element_id",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let port: i32 = row.get("port");
                Ok(Meter {
                    meter_id: row.get("meter_id"),
                    element_id: row.get("meter_element_id"),
                    name: row.get("name"),
                    ip: row.get("ip"),
                    port: u16::try_from(port)
                        .map_err(|_| DbError::Decode(format!("port {port}")))?,
                    active: row.get("active"),
                    device_model_id: row.get("device_model_id"),
                    tenant_id: row.get("tenant_id"),
                    location_id: row.get("location_id"),
                })
            })
            .collect()
    }
}
