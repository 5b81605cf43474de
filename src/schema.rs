// Column types are restricted to the set both backends share; timestamps are
// RFC 3339 text and JSON-encoded payloads are text.

diesel::table! {
    players (id) {
        id -> BigInt,
        agent_symbol -> Text,
        token -> Text,
        created_at -> Text,
        last_active -> Nullable<Text>,
        credits -> BigInt,
    }
}

diesel::table! {
    ships (symbol, player_id) {
        symbol -> Text,
        player_id -> BigInt,
        waypoint_symbol -> Text,
        nav_status -> Text,
        fuel_current -> BigInt,
        fuel_capacity -> BigInt,
        cargo_capacity -> BigInt,
        cargo_units -> BigInt,
        cargo -> Text,
        engine_speed -> BigInt,
        updated_at -> Text,
    }
}

diesel::table! {
    containers (container_id) {
        container_id -> Text,
        player_id -> BigInt,
        container_type -> Text,
        command_type -> Text,
        status -> Text,
        restart_policy -> Text,
        restart_count -> Integer,
        max_restarts -> Integer,
        config -> Text,
        started_at -> Nullable<Text>,
        stopped_at -> Nullable<Text>,
        exit_code -> Nullable<Integer>,
        exit_reason -> Nullable<Text>,
    }
}

diesel::table! {
    container_logs (log_id) {
        log_id -> BigInt,
        container_id -> Text,
        player_id -> BigInt,
        timestamp -> Text,
        level -> Text,
        message -> Text,
    }
}

diesel::table! {
    ship_assignments (ship_symbol, player_id) {
        ship_symbol -> Text,
        player_id -> BigInt,
        container_id -> Text,
        operation -> Text,
        status -> Text,
        assigned_at -> Text,
        released_at -> Nullable<Text>,
        release_reason -> Nullable<Text>,
    }
}

diesel::table! {
    waypoints (symbol) {
        symbol -> Text,
        system_symbol -> Text,
        waypoint_type -> Text,
        x -> Double,
        y -> Double,
        traits -> Text,
        has_fuel -> Bool,
        orbitals -> Text,
    }
}

diesel::table! {
    system_graphs (system_symbol) {
        system_symbol -> Text,
        graph -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    market_data (waypoint_symbol, good_symbol) {
        waypoint_symbol -> Text,
        good_symbol -> Text,
        supply -> Text,
        activity -> Nullable<Text>,
        purchase_price -> BigInt,
        sell_price -> BigInt,
        trade_volume -> BigInt,
        updated_at -> Text,
    }
}

diesel::table! {
    contracts (contract_id, player_id) {
        contract_id -> Text,
        player_id -> BigInt,
        contract -> Text,
        accepted -> Bool,
        fulfilled -> Bool,
        updated_at -> Text,
    }
}

diesel::table! {
    experiment_work_queue (queue_id) {
        queue_id -> BigInt,
        run_id -> Text,
        player_id -> BigInt,
        pair_id -> Text,
        good_symbol -> Text,
        buy_market -> Text,
        sell_market -> Text,
        status -> Text,
        claimed_by -> Nullable<Text>,
        claimed_at -> Nullable<Text>,
        completed_at -> Nullable<Text>,
        attempts -> Integer,
        error_message -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    market_experiments (id) {
        id -> BigInt,
        run_id -> Text,
        player_id -> BigInt,
        ship_symbol -> Text,
        pair_id -> Text,
        good_symbol -> Text,
        buy_market -> Text,
        sell_market -> Text,
        operation -> Text,
        iteration -> Integer,
        batch_size_fraction -> Double,
        units -> BigInt,
        price_per_unit -> BigInt,
        total_credits -> BigInt,
        supply_before -> Text,
        activity_before -> Nullable<Text>,
        trade_volume_before -> BigInt,
        price_before -> BigInt,
        supply_after -> Text,
        price_after -> BigInt,
        supply_change -> Text,
        price_impact_percent -> Double,
        ship_cargo_capacity -> BigInt,
        ship_cargo_used -> BigInt,
        minutes_since_last_trade -> Nullable<Double>,
        market_poll_timestamp -> Text,
        timestamp -> Text,
    }
}
