table! {
    task (id) {
        id -> Integer,
        natural_id -> Text,
        prompt -> Text,
        provider_name -> Text,
        model_id -> Text,
        aspect_ratio -> Text,
        image_size -> Text,
        timeout_secs -> Integer,
        total_count -> Integer,
        completed_count -> Integer,
        status_id -> Integer,
        error_message -> Nullable<Text>,
        config_json -> Text,
        created_date -> Timestamp,
        updated_date -> Timestamp,
        completed_date -> Nullable<Timestamp>,
    }
}

table! {
    image (id) {
        id -> Integer,
        natural_id -> Text,
        task_id -> Integer,
        idx -> Integer,
        path -> Nullable<Text>,
        thumb_path -> Nullable<Text>,
        byte_size -> BigInt,
        width -> Integer,
        height -> Integer,
        mime_type -> Nullable<Text>,
        status_id -> Integer,
        created_date -> Timestamp,
    }
}

joinable!(image -> task (task_id));
allow_tables_to_appear_in_same_query!(task, image);
