//! Diesel table declarations matching `migrations/`.

diesel::table! {
    sensor_readings (device_id, channel, observed_at) {
        device_id -> Text,
        channel -> Text,
        value -> Float8,
        unit -> Text,
        observed_at -> Timestamptz,
        received_at -> Timestamptz,
    }
}

diesel::table! {
    message_events (id, generated_at) {
        id -> Int8,
        generated_at -> Timestamptz,
        event_id -> Text,
        trigger -> Text,
        phase_date -> Nullable<Date>,
        slot -> Nullable<Int4>,
        tone -> Text,
        text -> Text,
        text_source -> Text,
        audio_ref -> Nullable<Text>,
        outcome -> Text,
        snapshot -> Jsonb,
    }
}

diesel::allow_tables_to_appear_in_same_query!(sensor_readings, message_events);
